//! Per-group and engine configuration.

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a group's `run` step executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// On its own worker task holding a bulkhead permit.
    #[default]
    Pooled,
    /// On the coordinating task itself.
    Inline,
}

impl std::str::FromStr for IsolationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pooled" | "thread" | "pool" => Ok(Self::Pooled),
            "inline" | "semaphore" => Ok(Self::Inline),
            other => Err(ConfigError::invalid(
                "isolation",
                format!("unknown strategy '{}'", other),
            )),
        }
    }
}

/// Settings applied when a command group is created.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    /// Concurrent executions allowed.
    pub pool_capacity: u32,
    /// Executions allowed to wait for a worker slot.
    pub pool_queue_depth: u32,
    /// Time allowed from submission to completion; `None` disables it.
    pub run_timeout: Option<Duration>,
    /// Error percentage at or above which the breaker opens.
    pub error_threshold_percent: u8,
    /// Requests needed in the window before the breaker may open.
    pub min_request_volume: u64,
    /// Time an open breaker waits before allowing a trial.
    pub sleep_window: Duration,
    pub window_bucket_count: u32,
    pub window_bucket_duration: Duration,
    pub isolation: IsolationStrategy,
    /// Fallbacks allowed to run at once.
    pub fallback_max_concurrent: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 10,
            pool_queue_depth: 10,
            run_timeout: Some(Duration::from_secs(1)),
            error_threshold_percent: 50,
            min_request_volume: 20,
            sleep_window: Duration::from_secs(5),
            window_bucket_count: 10,
            window_bucket_duration: Duration::from_secs(1),
            isolation: IsolationStrategy::Pooled,
            fallback_max_concurrent: 10,
        }
    }
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_capacity(mut self, capacity: u32) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn pool_queue_depth(mut self, depth: u32) -> Self {
        self.pool_queue_depth = depth;
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Let `run` take as long as it needs.
    pub fn without_timeout(mut self) -> Self {
        self.run_timeout = None;
        self
    }

    pub fn error_threshold_percent(mut self, percent: u8) -> Self {
        self.error_threshold_percent = percent;
        self
    }

    pub fn min_request_volume(mut self, volume: u64) -> Self {
        self.min_request_volume = volume;
        self
    }

    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.sleep_window = window;
        self
    }

    pub fn window(mut self, bucket_count: u32, bucket_duration: Duration) -> Self {
        self.window_bucket_count = bucket_count;
        self.window_bucket_duration = bucket_duration;
        self
    }

    pub fn isolation(mut self, isolation: IsolationStrategy) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn fallback_max_concurrent(mut self, limit: u32) -> Self {
        self.fallback_max_concurrent = limit;
        self
    }

    /// Check every knob is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::invalid("pool_capacity", "must be at least 1"));
        }
        if self.error_threshold_percent > 100 {
            return Err(ConfigError::invalid(
                "error_threshold_percent",
                format!("{} is above 100", self.error_threshold_percent),
            ));
        }
        if self.run_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("run_timeout", "must be non-zero"));
        }
        if self.sleep_window.is_zero() {
            return Err(ConfigError::invalid("sleep_window", "must be non-zero"));
        }
        if self.window_bucket_count == 0 {
            return Err(ConfigError::invalid(
                "window_bucket_count",
                "must be at least 1",
            ));
        }
        if self.window_bucket_duration.is_zero() {
            return Err(ConfigError::invalid(
                "window_bucket_duration",
                "must be non-zero",
            ));
        }
        if self.fallback_max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "fallback_max_concurrent",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Breaker settings for group `name`.
    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(name)
            .error_threshold_percent(self.error_threshold_percent)
            .min_request_volume(self.min_request_volume)
            .sleep_window(self.sleep_window)
    }

    /// Bulkhead settings for group `name`.
    pub fn bulkhead_config(&self, name: &str) -> BulkheadConfig {
        BulkheadConfig::new(name, self.pool_capacity).queue_depth(self.pool_queue_depth)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Applied to groups created on first use.
    pub default_group: GroupConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_group(mut self, config: GroupConfig) -> Self {
        self.default_group = config;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_group.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GroupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_capacity, 10);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.isolation, IsolationStrategy::Pooled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = GroupConfig::new().pool_capacity(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "pool_capacity", .. }));

        let err = GroupConfig::new()
            .error_threshold_percent(101)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "error_threshold_percent", .. }));

        let err = GroupConfig::new()
            .window(0, Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "window_bucket_count", .. }));

        assert!(GroupConfig::new().run_timeout(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_zero_queue_and_no_timeout_are_valid() {
        let config = GroupConfig::new().pool_queue_depth(0).without_timeout();
        assert!(config.validate().is_ok());
        assert!(config.run_timeout.is_none());
    }

    #[test]
    fn test_derived_component_configs() {
        let config = GroupConfig::new()
            .pool_capacity(3)
            .pool_queue_depth(1)
            .error_threshold_percent(25)
            .min_request_volume(4);

        let breaker = config.breaker_config("users");
        assert_eq!(breaker.name, "users");
        assert_eq!(breaker.error_threshold_percent, 25);
        assert_eq!(breaker.min_request_volume, 4);

        let bulkhead = config.bulkhead_config("users");
        assert_eq!(bulkhead.max_concurrent, 3);
        assert_eq!(bulkhead.queue_depth, 1);
    }

    #[test]
    fn test_isolation_from_str() {
        assert_eq!("inline".parse::<IsolationStrategy>().unwrap(), IsolationStrategy::Inline);
        assert_eq!("Pooled".parse::<IsolationStrategy>().unwrap(), IsolationStrategy::Pooled);
        assert!("fibers".parse::<IsolationStrategy>().is_err());
    }
}
