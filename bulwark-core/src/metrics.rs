//! Rolling outcome counters for a command group.
//!
//! A [`RollingWindow`] is a ring of fixed-duration buckets. Each bucket
//! remembers the epoch (bucket-sized tick since the window was created) it
//! was last written in; a writer that lands in a bucket holding an older
//! epoch clears it first, so buckets that fell out of the window age out
//! lazily as wall-clock time advances.
//!
//! ```text
//!  epoch:   41     42     43     44     45   <- now
//!         [ b1 ] [ b2 ] [ b3 ] [ b4 ] [ b0 ]
//!           ^ oldest bucket still counted
//! ```
//!
//! Increments are plain atomic adds. Only rotation of a stale bucket takes
//! the window's rotation lock, and [`RollingWindow::snapshot`] never takes
//! it at all.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const OUTCOME_COUNT: usize = 8;

/// Outcome of a single command execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// `run` returned a value in time.
    Success,
    /// `run` returned an error.
    Failure,
    /// `run` exceeded the group's run timeout.
    Timeout,
    /// The bulkhead refused the command (full or shut down).
    Rejected,
    /// The circuit breaker refused the command.
    ShortCircuited,
    /// The caller cancelled the command.
    Cancelled,
    /// The fallback produced a value.
    FallbackSuccess,
    /// The fallback failed.
    FallbackFailure,
}

impl Outcome {
    /// Every outcome, in counter order.
    pub const ALL: [Outcome; OUTCOME_COUNT] = [
        Outcome::Success,
        Outcome::Failure,
        Outcome::Timeout,
        Outcome::Rejected,
        Outcome::ShortCircuited,
        Outcome::Cancelled,
        Outcome::FallbackSuccess,
        Outcome::FallbackFailure,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Whether this outcome counts as an error for the breaker.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Failure | Self::Timeout | Self::Rejected)
    }

    /// Whether this outcome counts toward the breaker's request volume.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Timeout | Self::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::ShortCircuited => "short_circuited",
            Self::Cancelled => "cancelled",
            Self::FallbackSuccess => "fallback_success",
            Self::FallbackFailure => "fallback_failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Bucket {
    epoch: AtomicU64,
    counts: [AtomicU64; OUTCOME_COUNT],
}

impl Bucket {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn clear(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }

    fn requests(&self) -> u64 {
        Outcome::ALL
            .iter()
            .filter(|o| o.is_request())
            .map(|o| self.counts[o.index()].load(Ordering::Relaxed))
            .sum()
    }
}

/// Ring buffer of outcome counters covering `bucket_count * bucket_duration`.
pub struct RollingWindow {
    buckets: Box<[Bucket]>,
    bucket_duration: Duration,
    origin: Instant,
    rotation: Mutex<()>,
}

impl RollingWindow {
    /// Create a window of `bucket_count` buckets of `bucket_duration` each.
    ///
    /// Zero values are raised to one bucket / one millisecond; validated
    /// configurations never produce them.
    pub fn new(bucket_count: u32, bucket_duration: Duration) -> Self {
        let bucket_count = bucket_count.max(1) as usize;
        let bucket_duration = bucket_duration.max(Duration::from_millis(1));

        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            bucket_duration,
            origin: Instant::now(),
            rotation: Mutex::new(()),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_duration(&self) -> Duration {
        self.bucket_duration
    }

    /// Total span covered by the window.
    pub fn window(&self) -> Duration {
        self.bucket_duration * self.buckets.len() as u32
    }

    /// Count one outcome in the current bucket.
    pub fn record(&self, outcome: Outcome) {
        self.record_at(outcome, Instant::now());
    }

    pub(crate) fn record_at(&self, outcome: Outcome, now: Instant) {
        let epoch = self.epoch_at(now);
        let bucket = self.bucket_for(epoch);

        if bucket.epoch.load(Ordering::Acquire) < epoch {
            let _guard = self.rotation.lock();
            if bucket.epoch.load(Ordering::Acquire) < epoch {
                bucket.clear();
                bucket.epoch.store(epoch, Ordering::Release);
            }
        }

        bucket.counts[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Aggregate counts across every bucket still inside the window.
    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> WindowSnapshot {
        let epoch = self.epoch_at(now);
        let oldest = self.oldest_epoch(epoch);
        let mut snapshot = WindowSnapshot::default();

        for bucket in self.buckets.iter() {
            let bucket_epoch = bucket.epoch.load(Ordering::Acquire);
            if bucket_epoch >= oldest && bucket_epoch <= epoch {
                for outcome in Outcome::ALL {
                    let count = bucket.counts[outcome.index()].load(Ordering::Relaxed);
                    snapshot.add(outcome, count);
                }
            }
        }

        snapshot
    }

    /// Request totals per bucket, oldest first. Buckets with no traffic are zero.
    pub fn bucket_totals(&self) -> Vec<u64> {
        self.bucket_totals_at(Instant::now())
    }

    pub(crate) fn bucket_totals_at(&self, now: Instant) -> Vec<u64> {
        let epoch = self.epoch_at(now);
        let len = self.buckets.len() as u64;

        (0..len)
            .rev()
            .map(|back| match epoch.checked_sub(back) {
                Some(e) if e > 0 => {
                    let bucket = self.bucket_for(e);
                    if bucket.epoch.load(Ordering::Acquire) == e {
                        bucket.requests()
                    } else {
                        0
                    }
                }
                _ => 0,
            })
            .collect()
    }

    /// Rate statistics over the per-bucket request totals.
    pub fn stats(&self) -> RollingStats {
        RollingStats::new(self.bucket_totals(), self.bucket_duration)
    }

    /// Drop every recorded outcome.
    pub fn reset(&self) {
        let _guard = self.rotation.lock();
        for bucket in self.buckets.iter() {
            bucket.epoch.store(0, Ordering::Release);
            bucket.clear();
        }
    }

    // Epoch 0 marks a never-written bucket, so ticks start at 1.
    fn epoch_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        (elapsed / self.bucket_duration.as_nanos()) as u64 + 1
    }

    fn oldest_epoch(&self, epoch: u64) -> u64 {
        epoch
            .saturating_sub(self.buckets.len() as u64 - 1)
            .max(1)
    }

    fn bucket_for(&self, epoch: u64) -> &Bucket {
        &self.buckets[(epoch % self.buckets.len() as u64) as usize]
    }
}

impl fmt::Debug for RollingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollingWindow")
            .field("buckets", &self.buckets.len())
            .field("bucket_duration", &self.bucket_duration)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Aggregated outcome counts for the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub rejected: u64,
    pub short_circuited: u64,
    pub cancelled: u64,
    pub fallback_success: u64,
    pub fallback_failure: u64,
}

impl WindowSnapshot {
    fn add(&mut self, outcome: Outcome, count: u64) {
        let slot = match outcome {
            Outcome::Success => &mut self.success,
            Outcome::Failure => &mut self.failure,
            Outcome::Timeout => &mut self.timeout,
            Outcome::Rejected => &mut self.rejected,
            Outcome::ShortCircuited => &mut self.short_circuited,
            Outcome::Cancelled => &mut self.cancelled,
            Outcome::FallbackSuccess => &mut self.fallback_success,
            Outcome::FallbackFailure => &mut self.fallback_failure,
        };
        *slot += count;
    }

    /// Count for one outcome.
    pub fn count(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Success => self.success,
            Outcome::Failure => self.failure,
            Outcome::Timeout => self.timeout,
            Outcome::Rejected => self.rejected,
            Outcome::ShortCircuited => self.short_circuited,
            Outcome::Cancelled => self.cancelled,
            Outcome::FallbackSuccess => self.fallback_success,
            Outcome::FallbackFailure => self.fallback_failure,
        }
    }

    /// Requests that reached an execution decision: success, failure,
    /// timeout and bulkhead rejection.
    pub fn total(&self) -> u64 {
        self.success + self.failure + self.timeout + self.rejected
    }

    /// Failures, timeouts and bulkhead rejections.
    pub fn error_count(&self) -> u64 {
        self.failure + self.timeout + self.rejected
    }

    /// Error percentage in `0.0..=100.0`; zero when the window is empty.
    pub fn error_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.error_count() as f64 * 100.0 / total as f64
        }
    }

    /// Bulkhead rejections plus breaker short-circuits.
    pub fn rejections(&self) -> u64 {
        self.rejected + self.short_circuited
    }
}

/// Rate statistics over a window's per-bucket request totals.
#[derive(Debug, Clone)]
pub struct RollingStats {
    totals: Vec<u64>,
    bucket_duration: Duration,
}

impl RollingStats {
    pub fn new(totals: Vec<u64>, bucket_duration: Duration) -> Self {
        Self {
            totals,
            bucket_duration,
        }
    }

    pub fn totals(&self) -> &[u64] {
        &self.totals
    }

    /// Requests in the whole window.
    pub fn sum(&self) -> u64 {
        self.totals.iter().sum()
    }

    /// Average requests per second over the window.
    pub fn rate(&self) -> f64 {
        let window = self.bucket_duration.as_secs_f64() * self.totals.len() as f64;
        if window == 0.0 {
            0.0
        } else {
            self.sum() as f64 / window
        }
    }

    /// Highest per-bucket rate, in requests per second.
    pub fn peak_rate(&self) -> f64 {
        self.per_second(self.totals.iter().copied().max().unwrap_or(0))
    }

    /// Lowest per-bucket rate, in requests per second.
    pub fn min_rate(&self) -> f64 {
        self.per_second(self.totals.iter().copied().min().unwrap_or(0))
    }

    /// Population standard deviation of the bucket totals.
    pub fn std_dev(&self) -> f64 {
        if self.totals.is_empty() {
            return 0.0;
        }
        let n = self.totals.len() as f64;
        let mean = self.sum() as f64 / n;
        let variance = self
            .totals
            .iter()
            .map(|&t| {
                let d = t as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        variance.sqrt()
    }

    /// Median bucket total.
    pub fn median(&self) -> f64 {
        if self.totals.is_empty() {
            return 0.0;
        }
        let mut sorted = self.totals.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
        } else {
            sorted[mid] as f64
        }
    }

    fn per_second(&self, count: u64) -> f64 {
        let secs = self.bucket_duration.as_secs_f64();
        if secs == 0.0 { 0.0 } else { count as f64 / secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(window: &RollingWindow, millis: u64) -> Instant {
        window.origin + Duration::from_millis(millis)
    }

    #[test]
    fn test_record_and_snapshot() {
        let window = RollingWindow::new(10, Duration::from_secs(1));

        window.record(Outcome::Success);
        window.record(Outcome::Success);
        window.record(Outcome::Failure);
        window.record(Outcome::Timeout);
        window.record(Outcome::ShortCircuited);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.success, 2);
        assert_eq!(snapshot.failure, 1);
        assert_eq!(snapshot.timeout, 1);
        assert_eq!(snapshot.short_circuited, 1);
        assert_eq!(snapshot.total(), 4);
        assert_eq!(snapshot.error_count(), 2);
        assert_eq!(snapshot.error_percentage(), 50.0);
        assert_eq!(snapshot.rejections(), 1);
    }

    #[test]
    fn test_buckets_age_out() {
        let window = RollingWindow::new(10, Duration::from_secs(1));

        window.record_at(Outcome::Success, at(&window, 500));
        window.record_at(Outcome::Failure, at(&window, 1_500));

        let snapshot = window.snapshot_at(at(&window, 1_500));
        assert_eq!((snapshot.success, snapshot.failure), (1, 1));

        // First bucket has left the 10s window.
        let snapshot = window.snapshot_at(at(&window, 10_600));
        assert_eq!((snapshot.success, snapshot.failure), (0, 1));

        let snapshot = window.snapshot_at(at(&window, 11_600));
        assert_eq!(snapshot.total(), 0);
    }

    #[test]
    fn test_reused_bucket_is_cleared() {
        let window = RollingWindow::new(10, Duration::from_secs(1));

        window.record_at(Outcome::Failure, at(&window, 500));
        window.record_at(Outcome::Failure, at(&window, 600));
        // Same ring slot, one full window later.
        window.record_at(Outcome::Success, at(&window, 10_500));

        let snapshot = window.snapshot_at(at(&window, 10_500));
        assert_eq!(snapshot.failure, 0);
        assert_eq!(snapshot.success, 1);
    }

    #[test]
    fn test_reset() {
        let window = RollingWindow::new(10, Duration::from_secs(1));
        for _ in 0..5 {
            window.record(Outcome::Failure);
        }

        window.reset();
        assert_eq!(window.snapshot(), WindowSnapshot::default());

        window.record(Outcome::Success);
        assert_eq!(window.snapshot().success, 1);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let window = Arc::new(RollingWindow::new(10, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let window = window.clone();
                std::thread::spawn(move || {
                    let outcome = if i % 2 == 0 {
                        Outcome::Success
                    } else {
                        Outcome::Failure
                    };
                    for _ in 0..1_000 {
                        window.record(outcome);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = window.snapshot();
        assert_eq!(snapshot.success, 4_000);
        assert_eq!(snapshot.failure, 4_000);
    }

    #[test]
    fn test_bucket_totals_and_stats() {
        let window = RollingWindow::new(4, Duration::from_secs(1));

        for _ in 0..2 {
            window.record_at(Outcome::Success, at(&window, 100));
        }
        for _ in 0..4 {
            window.record_at(Outcome::Failure, at(&window, 1_100));
        }
        for _ in 0..6 {
            window.record_at(Outcome::Success, at(&window, 3_100));
        }
        // Not a request; ignored by the totals.
        window.record_at(Outcome::FallbackSuccess, at(&window, 3_100));

        let totals = window.bucket_totals_at(at(&window, 3_500));
        assert_eq!(totals, vec![2, 4, 0, 6]);

        let stats = RollingStats::new(totals, window.bucket_duration());
        assert_eq!(stats.sum(), 12);
        assert_eq!(stats.rate(), 3.0);
        assert_eq!(stats.peak_rate(), 6.0);
        assert_eq!(stats.min_rate(), 0.0);
        assert_eq!(stats.median(), 3.0);
        assert!((stats.std_dev() - 7f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_totals_before_window_filled() {
        let window = RollingWindow::new(3, Duration::from_secs(1));
        window.record_at(Outcome::Success, at(&window, 10));

        assert_eq!(window.bucket_totals_at(at(&window, 10)), vec![0, 0, 1]);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(Outcome::Failure.is_error());
        assert!(Outcome::Rejected.is_error());
        assert!(!Outcome::ShortCircuited.is_error());
        assert!(!Outcome::ShortCircuited.is_request());
        assert!(!Outcome::Cancelled.is_request());
        assert_eq!(Outcome::FallbackFailure.to_string(), "fallback_failure");
    }
}
