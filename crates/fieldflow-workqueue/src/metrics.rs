//! Queue metrics collection.
//!
//! Advisory observability for an external alerting consumer; nothing
//! here participates in queue correctness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

/// Aggregate counters plus per-task in-flight timing.
///
/// Shared across all workers. The in-flight map is keyed by task id, so
/// concurrent claim and resolve calls never touch the same entry.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    in_flight: DashMap<Uuid, Instant>,
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    busy_time_us: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub in_flight: u64,
    pub busy_time_us: u64,
}

impl QueueMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim; starts the task's cycle timer.
    pub fn record_claimed(&self, id: Uuid) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(id, Instant::now());
    }

    /// Record a successful completion.
    pub fn record_completed(&self, id: Uuid) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.finish(id);
    }

    /// Record a failed attempt that was rescheduled.
    pub fn record_retried(&self, id: Uuid) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.finish(id);
    }

    /// Record a dead-letter transition.
    pub fn record_dead_lettered(&self, id: Uuid) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.finish(id);
    }

    fn finish(&self, id: Uuid) {
        if let Some((_, started)) = self.in_flight.remove(&id) {
            let elapsed = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
            self.busy_time_us.fetch_add(elapsed, Ordering::Relaxed);
        }
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.in_flight.len() as u64,
            busy_time_us: self.busy_time_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_resolve_cycle() {
        let metrics = QueueMetrics::new();
        let id = Uuid::new_v4();

        metrics.record_claimed(id);
        assert_eq!(metrics.snapshot().in_flight, 1);

        metrics.record_completed(id);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claimed, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[test]
    fn test_each_outcome_counted() {
        let metrics = QueueMetrics::new();

        let retried = Uuid::new_v4();
        metrics.record_claimed(retried);
        metrics.record_retried(retried);

        let dead = Uuid::new_v4();
        metrics.record_claimed(dead);
        metrics.record_dead_lettered(dead);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claimed, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[test]
    fn test_resolve_without_claim_is_harmless() {
        let metrics = QueueMetrics::new();
        metrics.record_completed(Uuid::new_v4());
        assert_eq!(metrics.snapshot().completed, 1);
        assert_eq!(metrics.snapshot().busy_time_us, 0);
    }
}
