use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::PoolError;

/// Point-in-time view of the pool exposed to dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Live workers (idle or busy); respawning and retired slots excluded.
    pub workers: usize,
    /// Workers currently running a task.
    pub busy: usize,
    /// Tasks waiting for an idle worker.
    pub queued: usize,
    /// Tasks submitted but not yet resolved (waiting or in flight).
    pub pending: usize,
    /// Correlated responses consumed, successful or not.
    pub tasks_completed: u64,
    /// Subset of `tasks_completed` that reported a failure.
    pub tasks_failed: u64,
    /// Tasks accepted since init (cumulative, never decremented).
    pub tasks_queued: u64,
    /// Mean of dispatch-to-response time over completed tasks.
    pub avg_process_time_ms: f64,
}

/// Completion counters owned by the control loop.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    tasks_completed: u64,
    tasks_failed: u64,
    avg_process_time_ms: f64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a correlated response and fold its elapsed time into the mean.
    pub fn record_completion(&mut self, elapsed: Duration, success: bool) {
        self.tasks_completed += 1;
        if !success {
            self.tasks_failed += 1;
        }

        // Incremental mean: new_avg = prev_avg + (x - prev_avg) / count
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_process_time_ms +=
            (elapsed_ms - self.avg_process_time_ms) / self.tasks_completed as f64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Combine the counters with the control loop's worker gauges.
    ///
    /// Submission gauges are left at zero; [`SubmitCounters::fill`] owns them.
    pub fn snapshot(&self, workers: usize, busy: usize) -> PoolStats {
        PoolStats {
            workers,
            busy,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            avg_process_time_ms: self.avg_process_time_ms,
            ..PoolStats::default()
        }
    }
}

/// Submission gauges shared by the pool handle and the control loop.
///
/// The handle admits a task before `submit` returns, so a stats read right
/// after a submit already counts it. The control loop moves tasks out of
/// `queued` on dispatch and out of `pending` on resolution.
#[derive(Debug, Default)]
pub struct SubmitCounters {
    tasks_queued: AtomicU64,
    queued: AtomicUsize,
    pending: AtomicUsize,
}

impl SubmitCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new submission, or reject it when `capacity` tasks already wait.
    pub fn admit(&self, capacity: Option<usize>) -> Result<(), PoolError> {
        match capacity {
            Some(capacity) => self
                .queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < capacity).then_some(n + 1)
                })
                .map_err(|_| PoolError::QueueFull { capacity })?,
            None => self.queued.fetch_add(1, Ordering::SeqCst),
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tasks_queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Undo an admission whose command never reached the control loop.
    pub fn withdraw(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.tasks_queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// A queued task left the queue (dispatched or rejected).
    pub fn dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// A pending task was resolved or rejected.
    pub fn resolved(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Overlay the submission gauges on a control loop snapshot.
    pub fn fill(&self, stats: PoolStats) -> PoolStats {
        PoolStats {
            queued: self.queued.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
            tasks_queued: self.tasks_queued.load(Ordering::SeqCst),
            ..stats
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        let tolerance = 1e-6 * expected.abs().max(1e-9);
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn single_completion() {
        let mut stats = StatsAggregator::new();
        stats.record_completion(Duration::from_millis(100), true);

        let snap = stats.snapshot(1, 0);
        assert_eq!(snap.tasks_completed, 1);
        assert_close(snap.avg_process_time_ms, 100.0);
    }

    #[test]
    fn mean_of_two() {
        let mut stats = StatsAggregator::new();
        stats.record_completion(Duration::from_millis(100), true);
        stats.record_completion(Duration::from_millis(200), false);

        let snap = stats.snapshot(2, 0);
        assert_eq!(snap.tasks_completed, 2);
        assert_eq!(snap.tasks_failed, 1);
        assert_close(snap.avg_process_time_ms, 150.0);
    }

    #[test]
    fn incremental_mean_matches_full_recompute() {
        let mut rng = rand::thread_rng();
        let mut stats = StatsAggregator::new();
        let mut samples = Vec::new();

        for _ in 0..5_000 {
            let micros = rng.gen_range(1..250_000u64);
            let elapsed = Duration::from_micros(micros);
            samples.push(elapsed.as_secs_f64() * 1000.0);
            stats.record_completion(elapsed, rng.gen_bool(0.8));
        }

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let snap = stats.snapshot(4, 0);
        assert_eq!(snap.tasks_completed, samples.len() as u64);
        assert_close(snap.avg_process_time_ms, mean);
    }

    #[test]
    fn reset_clears_counters() {
        let mut stats = StatsAggregator::new();
        stats.record_completion(Duration::from_millis(5), true);
        stats.reset();
        assert_eq!(stats.snapshot(0, 0), PoolStats::default());
    }

    #[test]
    fn counters_track_submission_lifecycle() {
        let counters = SubmitCounters::new();
        for _ in 0..3 {
            counters.admit(None).unwrap();
        }
        counters.dequeued();
        counters.dequeued();
        counters.resolved();

        let snap = counters.fill(PoolStats::default());
        assert_eq!(snap.tasks_queued, 3);
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.pending, 2);
    }

    #[test]
    fn admit_respects_capacity() {
        let counters = SubmitCounters::new();
        counters.admit(Some(2)).unwrap();
        counters.admit(Some(2)).unwrap();
        assert!(matches!(
            counters.admit(Some(2)),
            Err(PoolError::QueueFull { capacity: 2 })
        ));
        assert_eq!(counters.fill(PoolStats::default()).tasks_queued, 2);

        counters.dequeued();
        counters.admit(Some(2)).unwrap();
        let snap = counters.fill(PoolStats::default());
        assert_eq!((snap.queued, snap.pending, snap.tasks_queued), (2, 3, 3));
    }

    #[test]
    fn withdraw_undoes_admit() {
        let counters = SubmitCounters::new();
        counters.admit(None).unwrap();
        counters.withdraw();
        assert_eq!(counters.fill(PoolStats::default()), PoolStats::default());
    }
}
