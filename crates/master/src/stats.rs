//! Statistics collectors for problems and for the master as a whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use farmhand_core::{ClientId, ProblemId, ProblemStatistics, SystemStatistics};

#[derive(Debug, Default)]
struct Timing {
    /// Partial problems whose duration went into the mean.
    timed: u64,
    mean: Duration,
    total_compute: Duration,
}

/// Per-problem statistics, shared by the driver and the dispatcher.
#[derive(Debug)]
pub struct ProblemStats {
    problem: ProblemId,
    client: ClientId,
    submitted_at: DateTime<Utc>,
    started: Instant,
    generated: AtomicU64,
    solved: AtomicU64,
    aborted: AtomicU64,
    speculative: AtomicU64,
    duplicates: AtomicU64,
    computing: AtomicU64,
    timing: Mutex<Timing>,
}

impl ProblemStats {
    pub fn new(problem: ProblemId, client: ClientId) -> Self {
        Self {
            problem,
            client,
            submitted_at: Utc::now(),
            started: Instant::now(),
            generated: AtomicU64::new(0),
            solved: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            speculative: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            computing: AtomicU64::new(0),
            timing: Mutex::new(Timing::default()),
        }
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_generated(&self) {
        self.generated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a partial problem whose winning result was accepted.
    pub fn record_solved(&self, duration: Duration) {
        self.solved.fetch_add(1, Ordering::Relaxed);
        let mut t = self.timing();
        t.timed += 1;
        t.total_compute += duration;
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        t.mean = if t.timed == 1 {
            duration
        } else {
            let prev = t.mean.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / t.timed as f64) as u64)
        };
    }

    /// Record a partial problem that lost its last claimant, or that was still
    /// outstanding when the problem ended. `spent` is the compute time it consumed.
    pub fn record_aborted(&self, spent: Duration) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        self.timing().total_compute += spent;
    }

    pub fn record_speculative(&self) {
        self.speculative.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.computing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        let _ = self
            .computing
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn computing_workers(&self) -> u64 {
        self.computing.load(Ordering::Relaxed)
    }

    pub fn mean_partial_duration(&self) -> Duration {
        self.timing().mean
    }

    pub fn total_compute(&self) -> Duration {
        self.timing().total_compute
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Compute time consumed per unit of wall-clock age.
    ///
    /// Low values mark problems that have been starved for a while.
    pub fn computation_ratio(&self) -> f64 {
        let age = self.age().as_secs_f64();
        if age <= 0.0 {
            return 0.0;
        }
        self.total_compute().as_secs_f64() / age
    }

    pub fn snapshot(&self, outstanding: usize) -> ProblemStatistics {
        let t = self.timing();
        ProblemStatistics {
            problem: Some(self.problem),
            client: Some(self.client),
            submitted_at: Some(self.submitted_at),
            age_ms: self.age().as_millis() as u64,
            generated: self.generated.load(Ordering::Relaxed),
            solved: self.solved.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            speculative_dispatches: self.speculative.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates.load(Ordering::Relaxed),
            outstanding: outstanding as u64,
            computing_workers: self.computing.load(Ordering::Relaxed),
            total_compute_ms: t.total_compute.as_millis() as u64,
            mean_partial_ms: t.mean.as_millis() as u64,
        }
    }
}

/// Master-wide counters. Worker and problem gauges are read from the
/// dispatcher when a snapshot is taken.
#[derive(Debug)]
pub struct SystemStats {
    started: Instant,
    problems_solved: AtomicU64,
    problems_aborted: AtomicU64,
    dispatches: AtomicU64,
    delivery_retries: AtomicU64,
    workers_lost: AtomicU64,
}

impl SystemStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            problems_solved: AtomicU64::new(0),
            problems_aborted: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            delivery_retries: AtomicU64::new(0),
            workers_lost: AtomicU64::new(0),
        }
    }

    pub fn record_problem_solved(&self) {
        self.problems_solved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_problem_aborted(&self) {
        self.problems_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.delivery_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_lost(&self) {
        self.workers_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        active_workers: usize,
        passive_workers: usize,
        running_problems: usize,
    ) -> SystemStatistics {
        SystemStatistics {
            registered_workers: (active_workers + passive_workers) as u64,
            active_workers: active_workers as u64,
            passive_workers: passive_workers as u64,
            running_problems: running_problems as u64,
            problems_solved: self.problems_solved.load(Ordering::Relaxed),
            problems_aborted: self.problems_aborted.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            delivery_retries: self.delivery_retries.load(Ordering::Relaxed),
            workers_lost: self.workers_lost.load(Ordering::Relaxed),
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for SystemStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> ProblemStats {
        ProblemStats::new(ProblemId::new(), ClientId::new())
    }

    #[test]
    fn single_solve_sets_mean() {
        let s = stats();
        s.record_solved(Duration::from_millis(100));
        assert_eq!(s.mean_partial_duration(), Duration::from_millis(100));
        assert_eq!(s.snapshot(0).solved, 1);
    }

    #[test]
    fn mean_is_incremental() {
        let s = stats();
        s.record_solved(Duration::from_millis(100));
        s.record_solved(Duration::from_millis(200));
        let avg = s.mean_partial_duration().as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
        assert_eq!(s.total_compute(), Duration::from_millis(300));
    }

    #[test]
    fn aborted_time_counts_as_compute_but_not_mean() {
        let s = stats();
        s.record_aborted(Duration::from_millis(40));
        assert_eq!(s.total_compute(), Duration::from_millis(40));
        assert_eq!(s.mean_partial_duration(), Duration::ZERO);
        assert_eq!(s.snapshot(3).aborted, 1);
        assert_eq!(s.snapshot(3).outstanding, 3);
    }

    #[test]
    fn computing_gauge_never_underflows() {
        let s = stats();
        s.worker_stopped();
        assert_eq!(s.computing_workers(), 0);
        s.worker_started();
        s.worker_started();
        s.worker_stopped();
        assert_eq!(s.computing_workers(), 1);
    }

    #[test]
    fn fresh_problem_has_zero_ratio() {
        assert_eq!(stats().computation_ratio(), 0.0);
    }

    #[test]
    fn system_snapshot_sums_workers() {
        let sys = SystemStats::new();
        sys.record_dispatch();
        sys.record_dispatch();
        sys.record_problem_solved();
        let snap = sys.snapshot(2, 3, 1);
        assert_eq!(snap.registered_workers, 5);
        assert_eq!(snap.dispatches, 2);
        assert_eq!(snap.problems_solved, 1);
        assert_eq!(snap.running_problems, 1);
    }
}
