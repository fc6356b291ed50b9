// Group settings as they appear in files and the environment

use crate::loader::{ConfigLoader, FileFormat, parse_env};
use crate::{ConfigError, EnvLoader, Result};
use bulwark_core::{CommandEngine, EngineConfig, GroupConfig, IsolationStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Name used for the defaults section in errors.
pub const DEFAULTS_SECTION: &str = "defaults";

/// Partial group configuration; unset fields inherit.
///
/// Durations are given in milliseconds. A `run_timeout_ms` of `0` disables
/// the timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_capacity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_queue_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_threshold_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_request_volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_bucket_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_bucket_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_max_concurrent: Option<u32>,
}

fn parse_field<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

impl GroupSettings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Set `field` from its string form.
    ///
    /// Returns `Ok(false)` for names that are not group fields.
    pub fn set(&mut self, field: &str, value: &str) -> Result<bool> {
        match field {
            "pool_capacity" => self.pool_capacity = Some(parse_field(field, value)?),
            "pool_queue_depth" => self.pool_queue_depth = Some(parse_field(field, value)?),
            "run_timeout_ms" => self.run_timeout_ms = Some(parse_field(field, value)?),
            "error_threshold_percent" => {
                self.error_threshold_percent = Some(parse_field(field, value)?)
            }
            "min_request_volume" => self.min_request_volume = Some(parse_field(field, value)?),
            "sleep_window_ms" => self.sleep_window_ms = Some(parse_field(field, value)?),
            "window_bucket_count" => self.window_bucket_count = Some(parse_field(field, value)?),
            "window_bucket_duration_ms" => {
                self.window_bucket_duration_ms = Some(parse_field(field, value)?)
            }
            "isolation" => self.isolation = Some(parse_field(field, value)?),
            "fallback_max_concurrent" => {
                self.fallback_max_concurrent = Some(parse_field(field, value)?)
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Overlay the fields set in `other`.
    pub fn merge(&mut self, other: &GroupSettings) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            pool_capacity,
            pool_queue_depth,
            run_timeout_ms,
            error_threshold_percent,
            min_request_volume,
            sleep_window_ms,
            window_bucket_count,
            window_bucket_duration_ms,
            isolation,
            fallback_max_concurrent
        );
    }

    /// Apply the set fields on top of `base`.
    pub fn apply_to(&self, mut base: GroupConfig) -> GroupConfig {
        if let Some(capacity) = self.pool_capacity {
            base.pool_capacity = capacity;
        }
        if let Some(depth) = self.pool_queue_depth {
            base.pool_queue_depth = depth;
        }
        match self.run_timeout_ms {
            Some(0) => base.run_timeout = None,
            Some(ms) => base.run_timeout = Some(Duration::from_millis(ms)),
            None => {}
        }
        if let Some(percent) = self.error_threshold_percent {
            base.error_threshold_percent = percent;
        }
        if let Some(volume) = self.min_request_volume {
            base.min_request_volume = volume;
        }
        if let Some(ms) = self.sleep_window_ms {
            base.sleep_window = Duration::from_millis(ms);
        }
        if let Some(count) = self.window_bucket_count {
            base.window_bucket_count = count;
        }
        if let Some(ms) = self.window_bucket_duration_ms {
            base.window_bucket_duration = Duration::from_millis(ms);
        }
        if let Some(isolation) = self.isolation {
            base.isolation = isolation;
        }
        if let Some(limit) = self.fallback_max_concurrent {
            base.fallback_max_concurrent = limit;
        }
        base
    }
}

/// Engine defaults plus named group overrides.
///
/// ```toml
/// [defaults]
/// pool_capacity = 20
///
/// [groups.payments]
/// pool_capacity = 4
/// run_timeout_ms = 250
/// isolation = "inline"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub defaults: GroupSettings,
    pub groups: BTreeMap<String, GroupSettings>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ConfigError::ParseError(format!("Invalid settings: {}", e)))
    }

    /// Load from a JSON, TOML or `.env` file chosen by name.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let loader = ConfigLoader::auto(path)?;

        match loader.format() {
            FileFormat::Env => {
                let content = std::fs::read_to_string(path)?;
                EnvLoader::default().load_from(parse_env(&content)?)
            }
            _ => Self::from_value(loader.load_file(path)?),
        }
    }

    /// Read `BULWARK_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        EnvLoader::default().load()
    }

    /// Overlay `other`, field by field.
    pub fn merge(mut self, other: Settings) -> Self {
        self.defaults.merge(&other.defaults);
        for (key, settings) in other.groups {
            self.groups.entry(key).or_default().merge(&settings);
        }
        self
    }

    pub fn group(&mut self, key: impl Into<String>, settings: GroupSettings) -> &mut Self {
        self.groups.insert(key.into(), settings);
        self
    }

    fn check(group: &str, config: GroupConfig) -> Result<GroupConfig> {
        config
            .validate()
            .map_err(|source| ConfigError::InvalidGroup {
                group: group.to_string(),
                source,
            })?;
        Ok(config)
    }

    /// Configuration for groups created on first use.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let defaults = Self::check(DEFAULTS_SECTION, self.defaults.apply_to(GroupConfig::default()))?;
        Ok(EngineConfig::new().default_group(defaults))
    }

    /// Defaults overlaid with the section for `key`, if any.
    pub fn group_config(&self, key: &str) -> Result<GroupConfig> {
        let mut config = self.defaults.apply_to(GroupConfig::default());
        if let Some(settings) = self.groups.get(key) {
            config = settings.apply_to(config);
        }
        Self::check(key, config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine_config()?;
        for key in self.groups.keys() {
            self.group_config(key)?;
        }
        Ok(())
    }

    /// Configure every named group on `engine`, returning their keys.
    ///
    /// Fails on the first group that already exists.
    pub fn apply(&self, engine: &CommandEngine) -> Result<Vec<String>> {
        let mut configured = Vec::with_capacity(self.groups.len());
        for key in self.groups.keys() {
            let config = self.group_config(key)?;
            engine
                .configure_group(key, config)
                .map_err(|source| ConfigError::InvalidGroup {
                    group: key.clone(),
                    source,
                })?;
            configured.push(key.clone());
        }
        Ok(configured)
    }

    /// Create an engine on the current runtime with these settings.
    pub fn build_engine(&self) -> Result<CommandEngine> {
        let engine = CommandEngine::new(self.engine_config()?)?;
        self.apply(&engine)?;
        Ok(engine)
    }
}
