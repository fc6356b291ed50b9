// Configuration file loaders

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
    /// `KEY=value` lines using the environment variable names.
    Env,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            "env" => Some(FileFormat::Env),
            _ => None,
        }
    }

    /// Detect the format of `path`, treating a bare `.env` file as `Env`.
    pub fn detect(path: &Path) -> Result<Self> {
        if path.file_name().and_then(|n| n.to_str()) == Some(".env") {
            return Ok(FileFormat::Env);
        }

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::LoadError("No file extension found".to_string()))?;

        FileFormat::from_extension(ext)
            .ok_or_else(|| ConfigError::LoadError(format!("Unsupported format: {}", ext)))
    }
}

/// Configuration file loader
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Auto-detect format from the file name
    pub fn auto(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(FileFormat::detect(path.as_ref())?))
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Load configuration from file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Value> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::LoadError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        self.parse(&content)
    }

    /// Parse configuration from string
    pub fn parse(&self, content: &str) -> Result<Value> {
        match self.format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("JSON parse error: {}", e))),
            FileFormat::Toml => {
                let value: toml::Value = toml::from_str(content)
                    .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
                serde_json::to_value(value).map_err(|e| {
                    ConfigError::ParseError(format!("TOML to JSON conversion error: {}", e))
                })
            }
            FileFormat::Env => {
                let map = parse_env(content)?
                    .into_iter()
                    .map(|(key, value)| (key, Value::String(value)))
                    .collect();
                Ok(Value::Object(map))
            }
        }
    }
}

/// Parse `.env` content into ordered key/value pairs without touching the
/// process environment.
pub(crate) fn parse_env(content: &str) -> Result<Vec<(String, String)>> {
    dotenvy::from_read_iter(content.as_bytes())
        .map(|item| item.map_err(|e| ConfigError::ParseError(format!(".env parse error: {}", e))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let result = loader
            .parse(r#"{"defaults": {"pool_capacity": 4}}"#)
            .unwrap();

        assert_eq!(result["defaults"]["pool_capacity"], 4);
    }

    #[test]
    fn test_parse_toml() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let toml = r#"
            [groups.users]
            pool_capacity = 2
            isolation = "inline"
        "#;

        let result = loader.parse(toml).unwrap();
        assert_eq!(result["groups"]["users"]["pool_capacity"], 2);
        assert_eq!(result["groups"]["users"]["isolation"], "inline");
    }

    #[test]
    fn test_parse_env() {
        let loader = ConfigLoader::new(FileFormat::Env);
        let env = "# defaults\nBULWARK_POOL_CAPACITY=4\nBULWARK_GROUP_USERS__ISOLATION=\"inline\"\n";

        let result = loader.parse(env).unwrap();
        assert_eq!(result["BULWARK_POOL_CAPACITY"], "4");
        assert_eq!(result["BULWARK_GROUP_USERS__ISOLATION"], "inline");
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConfigLoader::new(FileFormat::Json).parse("{").is_err());
        assert!(ConfigLoader::new(FileFormat::Toml).parse("[groups").is_err());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_extension("json"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("TOML"), Some(FileFormat::Toml));
        assert_eq!(FileFormat::from_extension("yaml"), None);

        assert_eq!(FileFormat::detect(Path::new(".env")).unwrap(), FileFormat::Env);
        assert_eq!(
            FileFormat::detect(Path::new("conf/bulwark.toml")).unwrap(),
            FileFormat::Toml
        );
        assert!(FileFormat::detect(Path::new("bulwark")).is_err());
    }
}
