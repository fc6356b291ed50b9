//! Circuit Breaker pattern implementation.
//!
//! The breaker watches its group's [`RollingWindow`] and "opens" to reject
//! requests when the error rate in the window crosses a threshold.
//!
//! ## States
//!
//! - **Closed**: Normal operation. Every `try_acquire` re-evaluates the
//!   window; once at least `min_request_volume` requests are in it and the
//!   error percentage is at or above `error_threshold_percent`, the breaker
//!   opens and that request is denied.
//! - **Open**: Requests are rejected until `sleep_window` has elapsed since
//!   opening. The first request after that moves the breaker to half-open
//!   and is granted as the trial.
//! - **Half-Open**: Exactly one trial is outstanding; every other request
//!   is rejected. A successful trial closes the breaker and clears the
//!   window. A failed, timed-out or rejected trial reopens it.
//!
//! Every admitted request holds a [`BreakerGrant`]. Only the grant of the
//! current trial can close or reopen the breaker; outcomes of requests
//! admitted earlier just land in the window. A trial grant dropped without
//! an outcome frees the slot for the next caller.
//!
//! Denials are counted as [`Outcome::ShortCircuited`], which is excluded
//! from the error rate so an open breaker cannot keep itself open.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark_core::{CircuitBreaker, CircuitBreakerConfig, Outcome, RollingWindow};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let window = Arc::new(RollingWindow::new(10, Duration::from_secs(1)));
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("inventory")
//!         .error_threshold_percent(50)
//!         .min_request_volume(20),
//!     window,
//! );
//!
//! if let Ok(grant) = breaker.try_acquire() {
//!     match call_inventory().await {
//!         Ok(_) => grant.record(Outcome::Success),
//!         Err(_) => grant.record(Outcome::Failure),
//!     }
//! }
//! ```

use crate::error::RejectionReason;
use crate::events::{CommandEvent, EventBus};
use crate::metrics::{Outcome, RollingWindow, WindowSnapshot};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, a single trial is testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the circuit breaker (the group key).
    pub name: String,
    /// Error percentage (0-100) at or above which the circuit opens.
    pub error_threshold_percent: u8,
    /// Minimum requests in the window before the error rate is considered.
    pub min_request_volume: u64,
    /// Time to wait before transitioning from open to half-open.
    pub sleep_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            error_threshold_percent: 50,
            min_request_volume: 20,
            sleep_window: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the error threshold percentage.
    pub fn error_threshold_percent(mut self, percent: u8) -> Self {
        self.error_threshold_percent = percent;
        self
    }

    /// Set the minimum request volume.
    pub fn min_request_volume(mut self, volume: u64) -> Self {
        self.min_request_volume = volume;
        self
    }

    /// Set the sleep window.
    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.sleep_window = window;
        self
    }
}

/// Internal circuit breaker state.
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    last_transition: Instant,
    /// Generation of the trial in flight, if any.
    trial: Option<u64>,
    next_trial: u64,
    forced_open: bool,
}

impl BreakerState {
    fn start_trial(&mut self) -> u64 {
        self.next_trial += 1;
        self.trial = Some(self.next_trial);
        self.next_trial
    }

    fn is_current_trial(&self, generation: u64) -> bool {
        self.state == CircuitState::HalfOpen && self.trial == Some(generation)
    }
}

/// Per-group circuit breaker driven by a rolling window.
///
/// All transitions happen under the breaker's own mutex, so transitions for
/// one group are linearizable and never contend with other groups.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    metrics: Arc<RollingWindow>,
    events: EventBus,
    inner: Mutex<BreakerState>,
    total_short_circuits: AtomicU64,
    total_trials: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker over `metrics`.
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<RollingWindow>) -> Arc<Self> {
        Self::with_events(config, metrics, EventBus::detached())
    }

    /// Create a circuit breaker that reports transitions to `events`.
    pub fn with_events(
        config: CircuitBreakerConfig,
        metrics: Arc<RollingWindow>,
        events: EventBus,
    ) -> Arc<Self> {
        info!(
            name = %config.name,
            error_threshold_percent = config.error_threshold_percent,
            min_request_volume = config.min_request_volume,
            sleep_window = ?config.sleep_window,
            "Circuit breaker initialized"
        );

        Arc::new(Self {
            config,
            metrics,
            events,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                last_transition: Instant::now(),
                trial: None,
                next_trial: 0,
                forced_open: false,
            }),
            total_short_circuits: AtomicU64::new(0),
            total_trials: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        })
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The window this breaker evaluates.
    pub fn metrics(&self) -> &Arc<RollingWindow> {
        &self.metrics
    }

    /// Get the current circuit state. Never causes a transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// When the circuit last opened, if it is open or half-open.
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self) -> Duration {
        self.inner.lock().last_transition.elapsed()
    }

    /// Ask to let a request through.
    ///
    /// In half-open state the grant is the single trial; report its outcome
    /// through [`BreakerGrant::record`].
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerGrant, RejectionReason> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let decision = match inner.state {
            CircuitState::Closed => {
                let snapshot = self.metrics.snapshot_at(now);
                if self.should_trip(&snapshot) {
                    warn!(
                        name = %self.config.name,
                        requests = snapshot.total(),
                        error_percentage = snapshot.error_percentage(),
                        "Error threshold reached"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                    Err(RejectionReason::CircuitOpen)
                } else {
                    Ok(None)
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or_default();

                if !inner.forced_open && elapsed >= self.config.sleep_window {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    self.total_trials.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(inner.start_trial()))
                } else {
                    Err(RejectionReason::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial.is_some() {
                    Err(RejectionReason::HalfOpenTrialInFlight)
                } else {
                    self.total_trials.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(inner.start_trial()))
                }
            }
        };
        drop(inner);

        match decision {
            Ok(trial) => Ok(BreakerGrant {
                breaker: Arc::clone(self),
                trial,
            }),
            Err(reason) => {
                self.metrics.record_at(Outcome::ShortCircuited, now);
                self.total_short_circuits.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.config.name, reason = %reason, "Circuit breaker rejected request");
                Err(reason)
            }
        }
    }

    /// Record the outcome of a request that holds no grant.
    ///
    /// Only feeds the window; it never moves a half-open breaker.
    pub fn record(&self, outcome: Outcome) {
        self.metrics.record(outcome);
    }

    fn should_trip(&self, snapshot: &WindowSnapshot) -> bool {
        let total = snapshot.total();
        total > 0
            && total >= self.config.min_request_volume
            && snapshot.error_count() * 100
                >= u64::from(self.config.error_threshold_percent) * total
    }

    fn on_trial_result(&self, generation: u64, succeeded: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.is_current_trial(generation) {
            return;
        }

        inner.trial = None;
        if succeeded {
            self.transition(&mut inner, CircuitState::Closed, now);
            self.metrics.reset();
        } else {
            self.transition(&mut inner, CircuitState::Open, now);
        }
    }

    // An abandoned trial gives the slot to the next caller.
    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.is_current_trial(generation) {
            inner.trial = None;
            debug!(name = %self.config.name, "Half-open trial released without a result");
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.last_transition = now;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!(name = %self.config.name, from = %from, "Circuit breaker OPENED");
            }
            CircuitState::HalfOpen => {
                debug!(name = %self.config.name, "Circuit breaker transitioning to HALF-OPEN");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                info!(name = %self.config.name, "Circuit breaker CLOSED");
            }
        }

        self.events.emit(CommandEvent::BreakerTransition {
            group: self.config.name.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Manually force the circuit open. It stays open until [`reset`](Self::reset).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = true;
        inner.trial = None;
        self.transition(&mut inner, CircuitState::Open, Instant::now());
    }

    /// Manually reset the circuit breaker to closed state and clear its window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        inner.trial = None;
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
        self.metrics.reset();
    }

    /// Get total requests denied by the breaker.
    pub fn total_short_circuits(&self) -> u64 {
        self.total_short_circuits.load(Ordering::Relaxed)
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: self.state(),
            window: self.metrics.snapshot(),
            total_short_circuits: self.total_short_circuits(),
            total_trials: self.total_trials.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Permission to run one request, returned by [`CircuitBreaker::try_acquire`].
///
/// Dropping a trial grant without recording releases the trial slot.
#[derive(Debug)]
#[must_use = "dropping a half-open trial grant releases the trial"]
pub struct BreakerGrant {
    breaker: Arc<CircuitBreaker>,
    trial: Option<u64>,
}

impl BreakerGrant {
    /// True when this request is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Record this request's outcome.
    ///
    /// The window always sees it. A trial's success closes the breaker, its
    /// failure, timeout or rejection reopens it, and a cancelled trial frees
    /// the slot. Outcomes of a stale trial (superseded by `force_open` or
    /// `reset`) only reach the window.
    pub fn record(mut self, outcome: Outcome) {
        self.breaker.metrics.record(outcome);

        let Some(generation) = self.trial.take() else {
            return;
        };
        match outcome {
            Outcome::Success => self.breaker.on_trial_result(generation, true),
            Outcome::Failure | Outcome::Timeout | Outcome::Rejected => {
                self.breaker.on_trial_result(generation, false)
            }
            Outcome::Cancelled
            | Outcome::ShortCircuited
            | Outcome::FallbackSuccess
            | Outcome::FallbackFailure => self.breaker.release_trial(generation),
        }
    }
}

impl Drop for BreakerGrant {
    fn drop(&mut self) {
        if let Some(generation) = self.trial.take() {
            self.breaker.release_trial(generation);
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Current window counts.
    pub window: WindowSnapshot,
    /// Requests denied by the breaker since creation.
    pub total_short_circuits: u64,
    /// Half-open trials granted since creation.
    pub total_trials: u64,
    /// Number of times the circuit opened.
    pub times_opened: u64,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 - 1.0) over the window.
    pub fn success_rate(&self) -> f64 {
        let total = self.window.total();
        if total == 0 {
            1.0
        } else {
            self.window.success as f64 / total as f64
        }
    }

    /// Calculate failure rate (0.0 - 1.0) over the window.
    pub fn failure_rate(&self) -> f64 {
        self.window.error_percentage() / 100.0
    }
}
