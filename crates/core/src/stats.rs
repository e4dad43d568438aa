//! Statistics snapshots handed to clients and exposed over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, ProblemId};

/// Point-in-time view of one problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemStatistics {
    pub problem: Option<ProblemId>,
    pub client: Option<ClientId>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub age_ms: u64,
    /// Partial problems produced by the problem.
    pub generated: u64,
    /// Partial solutions folded back in.
    pub solved: u64,
    /// Partial problems whose last claimant vanished, plus those still
    /// outstanding when the problem terminated.
    pub aborted: u64,
    /// Assignments of a partial problem to a worker that was not its first.
    pub speculative_dispatches: u64,
    /// Results that lost the race against an earlier report.
    pub duplicates_discarded: u64,
    /// Generated but not yet folded.
    pub outstanding: u64,
    /// Workers computing for this problem right now.
    pub computing_workers: u64,
    pub total_compute_ms: u64,
    pub mean_partial_ms: u64,
}

/// Point-in-time view of the whole master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatistics {
    pub registered_workers: u64,
    pub active_workers: u64,
    pub passive_workers: u64,
    pub running_problems: u64,
    pub problems_solved: u64,
    pub problems_aborted: u64,
    pub dispatches: u64,
    pub delivery_retries: u64,
    pub workers_lost: u64,
    pub uptime_ms: u64,
}
