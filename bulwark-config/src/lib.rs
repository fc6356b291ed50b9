// Configuration loading for bulwark command groups
//
// Settings come from JSON, TOML or `.env` files and `BULWARK_*` environment
// variables, then turn into `GroupConfig`s for a `CommandEngine`.

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use settings::{GroupSettings, Settings};

use std::path::Path;

/// Load `path` and overlay the process environment on top of it.
pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
    Ok(Settings::from_file(path)?.merge(Settings::from_env()?))
}
