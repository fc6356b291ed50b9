// Environment variable loading

use crate::{Result, Settings};
use std::env;

/// Default variable prefix.
pub const DEFAULT_PREFIX: &str = "BULWARK";

/// Reads group settings from environment variables.
///
/// `BULWARK_POOL_CAPACITY=20` sets a default and
/// `BULWARK_GROUP_PAYMENTS__POOL_CAPACITY=4` sets it for group `payments`.
/// Group keys are lowercased. Variables that name no group field are ignored.
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Load from the process environment
    pub fn load(&self) -> Result<Settings> {
        self.load_from(env::vars())
    }

    /// Load from explicit key/value pairs
    pub fn load_from<I, K, V>(&self, vars: I) -> Result<Settings>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Settings::new();
        let head = format!("{}_", self.prefix);

        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(&head) else {
                continue;
            };

            if let Some(scoped) = name.strip_prefix("GROUP_") {
                let Some((group, field)) = scoped.split_once("__") else {
                    continue;
                };
                if group.is_empty() {
                    continue;
                }
                let entry = settings.groups.entry(group.to_lowercase()).or_default();
                entry.set(&field.to_lowercase(), value.as_ref())?;
            } else {
                settings
                    .defaults
                    .set(&name.to_lowercase(), value.as_ref())?;
            }
        }

        // A group section made only of unknown fields is not a group.
        settings.groups.retain(|_, group| !group.is_empty());
        Ok(settings)
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigError;
    use bulwark_core::IsolationStrategy;

    #[test]
    fn test_defaults_and_groups() {
        let settings = EnvLoader::default()
            .load_from([
                ("BULWARK_POOL_CAPACITY", "20"),
                ("BULWARK_GROUP_PAYMENTS__POOL_CAPACITY", "4"),
                ("BULWARK_GROUP_PAYMENTS__ISOLATION", "semaphore"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();

        assert_eq!(settings.defaults.pool_capacity, Some(20));
        let payments = &settings.groups["payments"];
        assert_eq!(payments.pool_capacity, Some(4));
        assert_eq!(payments.isolation, Some(IsolationStrategy::Inline));
    }

    #[test]
    fn test_unrelated_variables_ignored() {
        let settings = EnvLoader::default()
            .load_from([
                ("BULWARK_LOG_LEVEL", "debug"),
                ("BULWARK_GROUP_X__COLOR", "red"),
                ("BULWARK_GROUP_NOFIELD", "1"),
            ])
            .unwrap();

        assert!(settings.defaults.is_empty());
        assert!(settings.groups.is_empty());
    }

    #[test]
    fn test_bad_value_is_an_error() {
        let result = EnvLoader::default().load_from([("BULWARK_SLEEP_WINDOW_MS", "soon")]);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_custom_prefix() {
        let loader = EnvLoader::new("APP");
        assert_eq!(loader.prefix(), "APP");

        let settings = loader
            .load_from([("APP_RUN_TIMEOUT_MS", "0"), ("BULWARK_POOL_CAPACITY", "3")])
            .unwrap();
        assert_eq!(settings.defaults.run_timeout_ms, Some(0));
        assert_eq!(settings.defaults.pool_capacity, None);
    }
}
