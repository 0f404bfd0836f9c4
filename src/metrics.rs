//! Monotonic counters and derived rates (spec §3 "Metrics", §6 snapshot
//! fields). Counters live on the engine; `snapshot()` computes the derived
//! rates at read time rather than maintaining them incrementally, the same
//! way the teacher computes `success_rate`-shaped values on demand instead
//! of keeping a running average.

use std::cell::Cell;
use std::time::Instant;

/// A point-in-time read of the engine's counters (spec §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub pending_requests: usize,
    pub queued_requests: usize,
    pub uptime_seconds: f64,
    pub requests_per_second: f64,
    pub success_rate: f64,
}

/// The engine's live counters. `Cell`-backed since `Client`/`Engine` are
/// single-threaded (spec §5) and counters are only ever read or incremented
/// from within `tick`/`submit`, never concurrently.
pub struct Metrics {
    started_at: Instant,
    total_requests: Cell<u64>,
    successful_requests: Cell<u64>,
    failed_requests: Cell<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: Cell::new(0),
            successful_requests: Cell::new(0),
            failed_requests: Cell::new(0),
        }
    }

    pub fn record_submission(&self) {
        self.total_requests.set(self.total_requests.get() + 1);
    }

    pub fn record_success(&self) {
        self.successful_requests.set(self.successful_requests.get() + 1);
    }

    pub fn record_failure(&self) {
        self.failed_requests.set(self.failed_requests.get() + 1);
    }

    pub fn snapshot(&self, pending_requests: usize, queued_requests: usize) -> MetricsSnapshot {
        let total = self.total_requests.get();
        let success = self.successful_requests.get();
        let failed = self.failed_requests.get();
        let uptime = self.started_at.elapsed().as_secs_f64();

        MetricsSnapshot {
            total_requests: total,
            successful_requests: success,
            failed_requests: failed,
            pending_requests,
            queued_requests,
            uptime_seconds: uptime,
            requests_per_second: if uptime > 0.0 { total as f64 / uptime } else { 0.0 },
            success_rate: if total > 0 {
                (success as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let metrics = Metrics::new();
        metrics.record_submission();
        metrics.record_submission();
        metrics.record_success();
        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.success_rate, 50.0);
    }

    #[test]
    fn zero_requests_yields_zero_rates_not_nan() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.requests_per_second, 0.0);
    }
}
