//! Bulkhead pattern for resource isolation.
//!
//! A bulkhead bounds how much of one group's work may be in flight: at most
//! `max_concurrent` executions run at once and at most `queue_depth` more
//! wait for a free slot. Anything beyond `max_concurrent + queue_depth` is
//! rejected immediately; nothing ever queues without bound.
//!
//! Admission is two-phase:
//!
//! ```text
//! try_enter()  ── occupancy < C + Q ? ──▶ BulkheadTicket (queued)
//!                        │ no                   │ acquire().await
//!                        ▼                      ▼
//!                 BulkheadError::Full     BulkheadPermit (active)
//! ```
//!
//! Dropping a ticket or permit frees its slot; the semaphore hands freed
//! worker slots to waiting tickets in FIFO order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark_core::{Bulkhead, BulkheadConfig};
//!
//! let bulkhead = Bulkhead::new(BulkheadConfig::new("inventory", 10).queue_depth(5));
//!
//! let result = bulkhead.call(|| async {
//!     expensive_operation().await
//! }).await;
//! ```

use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Bulkhead configuration.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Name of the bulkhead (the group key).
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrent: u32,
    /// Maximum executions waiting for a worker slot.
    pub queue_depth: u32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 10,
            queue_depth: 10,
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration.
    pub fn new(name: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            ..Default::default()
        }
    }

    /// Set the queue depth.
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }
}

/// Bulkhead error.
#[derive(Debug)]
pub enum BulkheadError<E = Infallible> {
    /// Bulkhead is full, request rejected.
    Full,
    /// Bulkhead has been shut down.
    Shutdown,
    /// Execution failed.
    Execution(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BulkheadError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Bulkhead is full"),
            Self::Shutdown => write!(f, "Bulkhead is shut down"),
            Self::Execution(e) => write!(f, "Execution failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BulkheadError<E> {}

impl BulkheadError {
    fn widen<E>(self) -> BulkheadError<E> {
        match self {
            Self::Full => BulkheadError::Full,
            Self::Shutdown => BulkheadError::Shutdown,
            Self::Execution(never) => match never {},
        }
    }
}

/// Bulkhead for limiting concurrent and queued access.
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    occupied: AtomicU32,
    active_count: AtomicU32,
    shutdown: AtomicBool,
    total_admitted: AtomicU64,
    total_rejections: AtomicU64,
}

impl Bulkhead {
    /// Create a new bulkhead.
    pub fn new(config: BulkheadConfig) -> Arc<Self> {
        info!(
            name = %config.name,
            max_concurrent = config.max_concurrent,
            queue_depth = config.queue_depth,
            "Bulkhead initialized"
        );

        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            config,
            occupied: AtomicU32::new(0),
            active_count: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            total_admitted: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    /// Get the bulkhead name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Maximum concurrent executions.
    pub fn capacity(&self) -> u32 {
        self.config.max_concurrent
    }

    /// Maximum waiting executions.
    pub fn queue_depth(&self) -> u32 {
        self.config.queue_depth
    }

    /// Get current number of active executions.
    pub fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Get current number of admitted executions still waiting for a slot.
    pub fn queued_count(&self) -> u32 {
        self.occupied
            .load(Ordering::SeqCst)
            .saturating_sub(self.active_count())
    }

    /// Check if the bulkhead can admit another execution.
    pub fn has_capacity(&self) -> bool {
        !self.is_shutdown() && self.occupied.load(Ordering::SeqCst) < self.limit()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn limit(&self) -> u32 {
        self.config
            .max_concurrent
            .saturating_add(self.config.queue_depth)
    }

    /// Reserve a running or queued slot without waiting.
    ///
    /// Fails fast with [`BulkheadError::Full`] when `active + queued` has
    /// reached `max_concurrent + queue_depth`.
    pub fn try_enter(self: &Arc<Self>) -> Result<BulkheadTicket, BulkheadError> {
        if self.is_shutdown() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(BulkheadError::Shutdown);
        }

        let limit = self.limit();
        let reserved = self
            .occupied
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |occupied| {
                (occupied < limit).then_some(occupied + 1)
            });

        match reserved {
            Ok(_) => {
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                Ok(BulkheadTicket {
                    bulkhead: Arc::clone(self),
                    promoted: false,
                })
            }
            Err(_) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.config.name, "Bulkhead full, rejecting request");
                Err(BulkheadError::Full)
            }
        }
    }

    /// Execute with bulkhead protection, queueing if a worker slot is busy.
    pub async fn call<F, Fut, T, E>(self: &Arc<Self>, f: F) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = self.try_enter().map_err(|e| e.widen())?;
        let permit = ticket.acquire().await.map_err(|e| e.widen())?;

        let result = f().await;
        drop(permit);

        result.map_err(BulkheadError::Execution)
    }

    /// Stop admitting work. Queued tickets fail to acquire; running work
    /// finishes normally.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(name = %self.config.name, "Bulkhead shut down");
            self.semaphore.close();
        }
    }

    /// Get bulkhead statistics.
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.config.name.clone(),
            max_concurrent: self.config.max_concurrent,
            queue_depth: self.config.queue_depth,
            active_count: self.active_count(),
            queued_count: self.queued_count(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            shutdown: self.is_shutdown(),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.config.name)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

/// An admitted execution waiting for a worker slot.
#[must_use = "dropping a ticket gives up its slot"]
pub struct BulkheadTicket {
    bulkhead: Arc<Bulkhead>,
    promoted: bool,
}

impl BulkheadTicket {
    /// Wait for a worker slot. Cancelling this future releases the ticket.
    pub async fn acquire(mut self) -> Result<BulkheadPermit, BulkheadError> {
        let permit = Arc::clone(&self.bulkhead.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadError::Shutdown)?;

        self.promoted = true;
        self.bulkhead.active_count.fetch_add(1, Ordering::SeqCst);

        Ok(BulkheadPermit {
            bulkhead: Arc::clone(&self.bulkhead),
            _permit: permit,
        })
    }
}

impl Drop for BulkheadTicket {
    fn drop(&mut self) {
        if !self.promoted {
            self.bulkhead.occupied.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A running execution's worker slot.
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.active_count.fetch_sub(1, Ordering::SeqCst);
        self.bulkhead.occupied.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bulkhead statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    /// Bulkhead name.
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrent: u32,
    /// Maximum waiting executions.
    pub queue_depth: u32,
    /// Current active executions.
    pub active_count: u32,
    /// Current waiting executions.
    pub queued_count: u32,
    /// Total admitted executions.
    pub total_admitted: u64,
    /// Total rejections.
    pub total_rejections: u64,
    /// Whether the bulkhead has been shut down.
    pub shutdown: bool,
}

impl BulkheadStats {
    /// Calculate utilization (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            0.0
        } else {
            self.active_count as f64 / self.max_concurrent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bulkhead_allows_concurrent() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 2));

        let result: Result<i32, BulkheadError<&str>> = bulkhead.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_beyond_capacity_plus_queue() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 2).queue_depth(1));

        let first = bulkhead.try_enter().unwrap().acquire().await.unwrap();
        let second = bulkhead.try_enter().unwrap().acquire().await.unwrap();
        let queued = bulkhead.try_enter().unwrap();

        assert_eq!(bulkhead.active_count(), 2);
        assert_eq!(bulkhead.queued_count(), 1);
        assert!(matches!(bulkhead.try_enter(), Err(BulkheadError::Full)));
        assert!(!bulkhead.has_capacity());

        drop(queued);
        assert_eq!(bulkhead.queued_count(), 0);
        assert!(bulkhead.try_enter().is_ok());

        drop((first, second));
        assert_eq!(bulkhead.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_release_promotes_queued_ticket() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 1).queue_depth(1));

        let running = bulkhead.try_enter().unwrap().acquire().await.unwrap();
        let ticket = bulkhead.try_enter().unwrap();

        let waiter = tokio::spawn(async move { ticket.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(running);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(bulkhead.active_count(), 0);
        assert_eq!(bulkhead.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_queue_depth_fails_fast() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 1).queue_depth(0));
        let _running = bulkhead.try_enter().unwrap().acquire().await.unwrap();

        let result: Result<i32, BulkheadError<&str>> = bulkhead.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(BulkheadError::Full)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_and_queued_work() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 1).queue_depth(1));
        let running = bulkhead.try_enter().unwrap().acquire().await.unwrap();
        let ticket = bulkhead.try_enter().unwrap();

        bulkhead.shutdown();

        assert!(matches!(ticket.acquire().await, Err(BulkheadError::Shutdown)));
        assert!(matches!(bulkhead.try_enter(), Err(BulkheadError::Shutdown)));
        assert_eq!(bulkhead.queued_count(), 0);

        drop(running);
        assert_eq!(bulkhead.stats().active_count, 0);
        assert!(bulkhead.stats().shutdown);
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_exceeds_limit() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 3).queue_depth(2));

        let tickets: Vec<_> = (0..20).filter_map(|_| bulkhead.try_enter().ok()).collect();

        assert_eq!(tickets.len(), 5);
        assert_eq!(bulkhead.stats().total_rejections, 15);
    }
}
