//! Observability metrics for the admission engine.
//!
//! Metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `capgate_operations_total` | Counter | `operation`, `result` | Capacity operations by outcome |
//! | `capgate_operation_duration_seconds` | Histogram | `operation` | End-to-end operation latency |
//! | `capgate_leases_granted_total` | Counter | - | Leases granted by acquire |
//! | `capgate_admission_cache_hits_total` | Counter | - | Acquires denied from the local cache |
//! | `capgate_duplicate_requests` | Histogram | - | Repeats of one acquire fingerprint within a window |
//! | `capgate_scavenger_reclaimed_leases_total` | Counter | `shard` | Leases reclaimed by the scavenger |
//! | `capgate_scavenger_pass_duration_seconds` | Histogram | `shard` | Scavenger pass latency |
//! | `capgate_migration_phase_duration_seconds` | Histogram | `phase` | Migration phase latency |
//! | `capgate_migration_pause_duration_seconds` | Histogram | - | Time extend/release were paused |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Counter: capacity operations by outcome.
    pub const OPERATIONS_TOTAL: &str = "capgate_operations_total";
    /// Histogram: operation latency in seconds.
    pub const OPERATION_DURATION_SECONDS: &str = "capgate_operation_duration_seconds";
    /// Counter: leases granted.
    pub const LEASES_GRANTED_TOTAL: &str = "capgate_leases_granted_total";
    /// Counter: admission cache hits.
    pub const ADMISSION_CACHE_HITS_TOTAL: &str = "capgate_admission_cache_hits_total";
    /// Histogram: duplicate acquire count per window.
    pub const DUPLICATE_REQUESTS: &str = "capgate_duplicate_requests";
    /// Counter: leases reclaimed by the scavenger.
    pub const SCAVENGER_RECLAIMED_TOTAL: &str = "capgate_scavenger_reclaimed_leases_total";
    /// Histogram: scavenger pass latency in seconds.
    pub const SCAVENGER_PASS_DURATION_SECONDS: &str = "capgate_scavenger_pass_duration_seconds";
    /// Histogram: migration phase latency in seconds.
    pub const MIGRATION_PHASE_DURATION_SECONDS: &str = "capgate_migration_phase_duration_seconds";
    /// Histogram: migration pause in seconds.
    pub const MIGRATION_PAUSE_DURATION_SECONDS: &str = "capgate_migration_pause_duration_seconds";
}

/// Label keys.
pub mod labels {
    /// Operation (acquire, check, extend, release).
    pub const OPERATION: &str = "operation";
    /// Outcome (granted, denied, cached, replayed, error, ...).
    pub const RESULT: &str = "result";
    /// Scavenger shard index.
    pub const SHARD: &str = "shard";
    /// Migration phase.
    pub const PHASE: &str = "phase";
}

/// Records engine metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityMetrics;

impl CapacityMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Counts one operation outcome.
    pub fn record_operation(&self, operation: &'static str, result: &'static str) {
        counter!(
            names::OPERATIONS_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records operation latency.
    pub fn observe_operation_duration(&self, operation: &'static str, duration: Duration) {
        histogram!(names::OPERATION_DURATION_SECONDS, labels::OPERATION => operation)
            .record(duration.as_secs_f64());
    }

    /// Counts granted leases.
    pub fn record_leases_granted(&self, count: usize) {
        counter!(names::LEASES_GRANTED_TOTAL).increment(count as u64);
    }

    /// Counts an admission cache hit.
    pub fn record_admission_cache_hit(&self) {
        counter!(names::ADMISSION_CACHE_HITS_TOTAL).increment(1);
    }

    /// Records how often one fingerprint repeated within a window.
    #[allow(clippy::cast_precision_loss)] // counts are small
    pub fn observe_duplicate_requests(&self, count: u64) {
        histogram!(names::DUPLICATE_REQUESTS).record(count as f64);
    }

    /// Counts reclaimed leases.
    pub fn record_reclaimed(&self, shard: u32, count: usize) {
        counter!(names::SCAVENGER_RECLAIMED_TOTAL, labels::SHARD => shard.to_string())
            .increment(count as u64);
    }

    /// Records a scavenger pass.
    pub fn observe_scavenger_pass(&self, shard: u32, duration: Duration) {
        histogram!(names::SCAVENGER_PASS_DURATION_SECONDS, labels::SHARD => shard.to_string())
            .record(duration.as_secs_f64());
    }

    /// Records a migration phase.
    pub fn observe_migration_phase(&self, phase: &'static str, duration: Duration) {
        histogram!(names::MIGRATION_PHASE_DURATION_SECONDS, labels::PHASE => phase)
            .record(duration.as_secs_f64());
    }

    /// Records the extend/release pause of a migration.
    pub fn observe_migration_pause(&self, duration: Duration) {
        histogram!(names::MIGRATION_PAUSE_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// Calls `on_drop` with the elapsed time when dropped.
///
/// ```rust
/// use capgate_engine::metrics::{CapacityMetrics, TimingGuard};
///
/// let metrics = CapacityMetrics::new();
/// {
///     let _guard = TimingGuard::new(|d| metrics.observe_operation_duration("check", d));
///     // ...
/// }
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Times one capacity operation.
#[must_use]
pub fn time_operation(operation: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        CapacityMetrics::new().observe_operation_duration(operation, duration);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        let metrics = CapacityMetrics::new();
        metrics.record_operation("acquire", "granted");
        metrics.record_leases_granted(3);
        metrics.observe_duplicate_requests(2);
        metrics.record_reclaimed(0, 1);
        metrics.observe_migration_phase("final_sync", Duration::from_millis(5));
    }

    #[test]
    fn timing_guard_reports_on_drop() {
        let mut seen = None;
        {
            let _guard = TimingGuard::new(|d| seen = Some(d));
        }
        assert!(seen.is_some());
    }
}
