//! Command groups and the registry that owns them.
//!
//! A group is the isolation domain for one dependency. It owns exactly one
//! rolling window, one breaker reading that window and one bulkhead, and
//! nothing in it is shared with any other group.

use crate::bulkhead::{Bulkhead, BulkheadStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::{GroupConfig, IsolationStrategy};
use crate::error::ConfigError;
use crate::events::EventBus;
use crate::metrics::RollingWindow;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Breaker, window and bulkhead for one group key.
pub struct CommandGroup {
    key: Arc<str>,
    config: GroupConfig,
    metrics: Arc<RollingWindow>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Arc<Bulkhead>,
    fallback_slots: Arc<Semaphore>,
}

impl CommandGroup {
    pub(crate) fn new(key: &str, config: GroupConfig, events: EventBus) -> Arc<Self> {
        let metrics = Arc::new(RollingWindow::new(
            config.window_bucket_count,
            config.window_bucket_duration,
        ));
        let breaker =
            CircuitBreaker::with_events(config.breaker_config(key), Arc::clone(&metrics), events);
        let bulkhead = Bulkhead::new(config.bulkhead_config(key));

        debug!(group = key, isolation = ?config.isolation, "Command group created");

        Arc::new(Self {
            key: Arc::from(key),
            fallback_slots: Arc::new(Semaphore::new(config.fallback_max_concurrent as usize)),
            config,
            metrics,
            breaker,
            bulkhead,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn shared_key(&self) -> Arc<str> {
        Arc::clone(&self.key)
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RollingWindow> {
        &self.metrics
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn bulkhead(&self) -> &Arc<Bulkhead> {
        &self.bulkhead
    }

    /// A fallback slot, or `None` when the group's fallback limit is reached.
    pub(crate) fn try_fallback_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.fallback_slots).try_acquire_owned().ok()
    }

    /// Read-only view for monitoring.
    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            group: self.key.to_string(),
            isolation: self.config.isolation,
            breaker: self.breaker.stats(),
            pool: self.bulkhead.stats(),
            request_rate: self.metrics.stats().rate(),
        }
    }
}

impl std::fmt::Debug for CommandGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGroup")
            .field("key", &self.key)
            .field("breaker", &self.breaker)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}

/// Serializable state of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub group: String,
    pub isolation: IsolationStrategy,
    pub breaker: CircuitBreakerStats,
    pub pool: BulkheadStats,
    /// Requests per second across the window.
    pub request_rate: f64,
}

/// Owner of every [`CommandGroup`], keyed by group key.
///
/// Groups are created on first use with the registry's defaults, or up
/// front through [`configure`](Self::configure). They live as long as the
/// registry.
pub struct GroupRegistry {
    groups: DashMap<String, Arc<CommandGroup>>,
    defaults: GroupConfig,
    events: EventBus,
    shutdown: AtomicBool,
}

impl GroupRegistry {
    pub fn new(defaults: GroupConfig, events: EventBus) -> Self {
        Self {
            groups: DashMap::new(),
            defaults,
            events,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn defaults(&self) -> &GroupConfig {
        &self.defaults
    }

    pub fn get(&self, key: &str) -> Option<Arc<CommandGroup>> {
        self.groups.get(key).map(|group| Arc::clone(group.value()))
    }

    /// The group for `key`, created with the defaults if missing.
    pub fn get_or_create(&self, key: &str) -> Arc<CommandGroup> {
        if let Some(group) = self.get(key) {
            return group;
        }

        let group = self
            .groups
            .entry(key.to_string())
            .or_insert_with(|| self.build(key, self.defaults.clone()));
        Arc::clone(group.value())
    }

    /// Create `key` with an explicit configuration.
    ///
    /// Fails if the configuration is invalid or the group already exists.
    pub fn configure(&self, key: &str, config: GroupConfig) -> Result<Arc<CommandGroup>, ConfigError> {
        config.validate()?;

        match self.groups.entry(key.to_string()) {
            Entry::Occupied(_) => Err(ConfigError::GroupAlreadyInitialized(key.to_string())),
            Entry::Vacant(entry) => {
                let group = self.build(key, config);
                entry.insert(Arc::clone(&group));
                info!(group = key, "Command group configured");
                Ok(group)
            }
        }
    }

    fn build(&self, key: &str, config: GroupConfig) -> Arc<CommandGroup> {
        let group = CommandGroup::new(key, config, self.events.clone());
        if self.shutdown.load(Ordering::SeqCst) {
            group.bulkhead().shutdown();
        }
        group
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Snapshots of every group, sorted by key.
    pub fn snapshots(&self) -> Vec<GroupSnapshot> {
        let mut snapshots: Vec<GroupSnapshot> =
            self.groups.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.group.cmp(&b.group));
        snapshots
    }

    /// Shut down every pool, including ones created afterwards.
    pub fn shutdown_all(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for group in self.groups.iter() {
            group.bulkhead().shutdown();
        }
        info!(groups = self.groups.len(), "All command pools shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("groups", &self.keys())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::metrics::Outcome;

    fn registry() -> GroupRegistry {
        GroupRegistry::new(GroupConfig::default(), EventBus::detached())
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = registry();
        assert!(registry.is_empty());

        let a = registry.get_or_create("users");
        let b = registry.get_or_create("users");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.config(), &GroupConfig::default());
    }

    #[test]
    fn test_configure_before_first_use() {
        let registry = registry();
        let config = GroupConfig::new().pool_capacity(2).pool_queue_depth(0);

        let group = registry.configure("payments", config.clone()).unwrap();
        assert_eq!(group.bulkhead().capacity(), 2);
        assert!(Arc::ptr_eq(&group, &registry.get_or_create("payments")));

        let err = registry.configure("payments", config).unwrap_err();
        assert_eq!(err, ConfigError::GroupAlreadyInitialized("payments".to_string()));
    }

    #[test]
    fn test_configure_validates() {
        let registry = registry();
        assert!(registry
            .configure("bad", GroupConfig::new().pool_capacity(0))
            .is_err());
        assert!(registry.get("bad").is_none());
    }

    #[test]
    fn test_groups_are_isolated() {
        let registry = registry();
        let config = GroupConfig::new().min_request_volume(2);
        let users = registry.configure("users", config.clone()).unwrap();
        let orders = registry.configure("orders", config).unwrap();

        users.breaker().record(Outcome::Failure);
        users.breaker().record(Outcome::Failure);
        assert!(users.breaker().try_acquire().is_err());

        assert_eq!(users.breaker().state(), CircuitState::Open);
        assert_eq!(orders.breaker().state(), CircuitState::Closed);
        assert!(orders.breaker().try_acquire().is_ok());
        assert_eq!(orders.metrics().snapshot().total(), 0);
    }

    #[test]
    fn test_shutdown_all_covers_new_groups() {
        let registry = registry();
        let existing = registry.get_or_create("users");

        registry.shutdown_all();
        let created_later = registry.get_or_create("orders");

        assert!(existing.bulkhead().is_shutdown());
        assert!(created_later.bulkhead().is_shutdown());
    }

    #[test]
    fn test_fallback_slots_are_bounded() {
        let registry = registry();
        let group = registry
            .configure("users", GroupConfig::new().fallback_max_concurrent(1))
            .unwrap();

        let slot = group.try_fallback_slot();
        assert!(slot.is_some());
        assert!(group.try_fallback_slot().is_none());
        drop(slot);
        assert!(group.try_fallback_slot().is_some());
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = registry();
        registry.get_or_create("users").breaker().record(Outcome::Success);

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);

        let json = serde_json::to_value(&snapshots[0]).unwrap();
        assert_eq!(json["group"], "users");
        assert_eq!(json["breaker"]["state"], "closed");
        assert_eq!(json["breaker"]["window"]["success"], 1);
        assert_eq!(json["pool"]["max_concurrent"], 10);
    }
}
