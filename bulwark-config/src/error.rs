// Error types for loading group configuration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration for group '{group}': {source}")]
    InvalidGroup {
        group: String,
        #[source]
        source: bulwark_core::ConfigError,
    },

    #[error("Failed to start engine: {0}")]
    Engine(#[from] bulwark_core::EngineError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
