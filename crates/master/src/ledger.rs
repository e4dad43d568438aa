//! Per-problem bookkeeping of partial problems and the workers claiming them.
//!
//! A [`PartialProblemRecord`] is generated by a driver, handed out by the
//! dispatcher and settled exactly once: either by the first worker that
//! reports back for it, or by the owning problem ending. Claim-set changes
//! are linearized by the record's own lock.
//!
//! Lock order across the crate is worker slot -> record claims -> collection
//! (ledger state, membership, problem table). Nothing here takes a record
//! lock while holding the ledger lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use farmhand_core::{AssignmentKey, PartialProblem, PartialProblemId, ProblemId, WorkerId};

use crate::context::ProblemContext;
use crate::queue::WorkQueue;
use crate::stats::ProblemStats;

#[derive(Debug, Default)]
struct ClaimState {
    workers: Vec<WorkerId>,
    /// Set while at least one worker computes the record.
    started: Option<Instant>,
    settled: bool,
}

/// Result of trying to add a worker to a record's claim set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The record had no claimant before.
    First,
    /// The record was already being computed elsewhere.
    Additional,
    /// The record is settled, already claimed by this worker, or at its claim limit.
    Rejected,
}

/// Result of removing a worker from a record's claim set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The worker was the last claimant; the record is unclaimed again.
    /// Carries the compute time spent since the first claim.
    LastClaimant(Duration),
    /// Other workers still compute the record.
    OthersRemain,
    /// The worker held no claim, or the record is already settled.
    NotClaimed,
}

/// Result of a worker reporting back for a record.
#[derive(Debug, PartialEq, Eq)]
pub enum Settlement {
    /// This report is the one that counts. `others` must be told to stop.
    Won {
        others: Vec<WorkerId>,
        duration: Duration,
    },
    /// Someone settled the record first.
    Lost,
}

/// One generated partial problem and its claim set.
pub struct PartialProblemRecord {
    id: PartialProblemId,
    problem: ProblemId,
    owner: Weak<ProblemContext>,
    stats: Arc<ProblemStats>,
    partial_problem: PartialProblem,
    claims: Mutex<ClaimState>,
}

impl PartialProblemRecord {
    pub fn new(
        id: PartialProblemId,
        owner: &Arc<ProblemContext>,
        partial_problem: PartialProblem,
    ) -> Self {
        Self {
            id,
            problem: owner.id(),
            owner: Arc::downgrade(owner),
            stats: owner.stats().clone(),
            partial_problem,
            claims: Mutex::new(ClaimState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClaimState> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> PartialProblemId {
        self.id
    }

    pub fn problem(&self) -> ProblemId {
        self.problem
    }

    pub fn key(&self) -> AssignmentKey {
        AssignmentKey {
            problem: self.problem,
            partial: self.id,
        }
    }

    /// The owning problem, unless it has been torn down.
    pub fn owner(&self) -> Option<Arc<ProblemContext>> {
        self.owner.upgrade()
    }

    pub fn stats(&self) -> &Arc<ProblemStats> {
        &self.stats
    }

    pub fn partial_problem(&self) -> &PartialProblem {
        &self.partial_problem
    }

    /// Add `worker` to the claim set. `max_claims` of 0 means unlimited.
    pub fn try_claim(&self, worker: WorkerId, max_claims: usize) -> ClaimOutcome {
        let mut c = self.lock();
        if c.settled || c.workers.contains(&worker) {
            return ClaimOutcome::Rejected;
        }
        if max_claims > 0 && c.workers.len() >= max_claims {
            return ClaimOutcome::Rejected;
        }
        c.workers.push(worker);
        if c.workers.len() == 1 {
            c.started = Some(Instant::now());
            ClaimOutcome::First
        } else {
            ClaimOutcome::Additional
        }
    }

    /// Remove `worker` from the claim set without settling the record.
    pub fn release(&self, worker: WorkerId) -> ReleaseOutcome {
        let mut c = self.lock();
        if c.settled {
            return ReleaseOutcome::NotClaimed;
        }
        let Some(pos) = c.workers.iter().position(|w| *w == worker) else {
            return ReleaseOutcome::NotClaimed;
        };
        c.workers.swap_remove(pos);
        if c.workers.is_empty() {
            let spent = c.started.take().map(|s| s.elapsed()).unwrap_or_default();
            ReleaseOutcome::LastClaimant(spent)
        } else {
            ReleaseOutcome::OthersRemain
        }
    }

    /// Settle the record on behalf of `worker`. Only the first call wins.
    pub fn settle(&self, worker: WorkerId) -> Settlement {
        let mut c = self.lock();
        if c.settled {
            return Settlement::Lost;
        }
        c.settled = true;
        let duration = c.started.take().map(|s| s.elapsed()).unwrap_or_default();
        let others = c.workers.drain(..).filter(|w| *w != worker).collect();
        Settlement::Won { others, duration }
    }

    /// Settle the record because its problem ended. Returns the workers that
    /// were still computing it and the compute time they spent.
    pub fn revoke_all(&self) -> (Vec<WorkerId>, Duration) {
        let mut c = self.lock();
        c.settled = true;
        let spent = c.started.take().map(|s| s.elapsed()).unwrap_or_default();
        (c.workers.drain(..).collect(), spent)
    }

    pub fn claimants(&self) -> Vec<WorkerId> {
        self.lock().workers.clone()
    }

    pub fn claim_count(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_settled(&self) -> bool {
        self.lock().settled
    }

    fn accepts(&self, worker: WorkerId, max_claims: usize) -> bool {
        let c = self.lock();
        !c.settled
            && !c.workers.is_empty()
            && !c.workers.contains(&worker)
            && (max_claims == 0 || c.workers.len() < max_claims)
    }
}

impl PartialEq for PartialProblemRecord {
    fn eq(&self, other: &Self) -> bool {
        self.problem == other.problem && self.id == other.id
    }
}

impl std::fmt::Debug for PartialProblemRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialProblemRecord")
            .field("id", &self.id)
            .field("problem", &self.problem)
            .field("claims", &self.claim_count())
            .finish()
    }
}

#[derive(Default)]
struct LedgerState {
    /// Generated and not yet settled.
    outstanding: HashMap<PartialProblemId, Arc<PartialProblemRecord>>,
    /// Records that lost their last claimant; offered before fresh work.
    preferred: VecDeque<Arc<PartialProblemRecord>>,
    /// Records claimed by at least one worker, in rotation order.
    in_flight: IndexMap<PartialProblemId, Arc<PartialProblemRecord>>,
    cursor: usize,
}

/// The partial problems of one problem.
pub struct Ledger {
    fresh: WorkQueue<Arc<PartialProblemRecord>>,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            fresh: WorkQueue::unbounded(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a freshly generated record. Returns `true` if the problem had no
    /// fresh work queued before, i.e. it just became selectable.
    pub async fn admit(&self, record: Arc<PartialProblemRecord>) -> bool {
        self.lock().outstanding.insert(record.id(), record.clone());
        match self.fresh.try_put(record) {
            Ok(prev) => prev == 0,
            Err(record) => {
                self.fresh.put(record).await;
                false
            }
        }
    }

    pub fn has_fresh(&self) -> bool {
        !self.fresh.is_empty()
    }

    /// Next fresh record, skipping any settled while queued.
    pub fn take_fresh(&self) -> Option<Arc<PartialProblemRecord>> {
        while let Some(record) = self.fresh.try_take() {
            if self.is_outstanding(record.id()) {
                return Some(record);
            }
        }
        None
    }

    /// Queue an unclaimed record for re-offer ahead of fresh work.
    /// Ignored if the record is no longer outstanding.
    pub fn push_preferred(&self, record: Arc<PartialProblemRecord>) -> bool {
        let mut st = self.lock();
        if !st.outstanding.contains_key(&record.id()) {
            return false;
        }
        st.in_flight.shift_remove(&record.id());
        if !st.preferred.iter().any(|r| r.id() == record.id()) {
            st.preferred.push_back(record);
        }
        true
    }

    /// Next preferred record that is still outstanding.
    pub fn take_preferred(&self) -> Option<Arc<PartialProblemRecord>> {
        let mut st = self.lock();
        while let Some(record) = st.preferred.pop_front() {
            if st.outstanding.contains_key(&record.id()) {
                return Some(record);
            }
        }
        None
    }

    pub fn has_preferred(&self) -> bool {
        !self.lock().preferred.is_empty()
    }

    /// Record that a worker now computes `record`.
    pub fn mark_in_flight(&self, record: &Arc<PartialProblemRecord>) {
        let mut st = self.lock();
        if st.outstanding.contains_key(&record.id()) {
            st.in_flight.insert(record.id(), record.clone());
        }
    }

    /// Rotate through in-flight records and return the next one `worker`
    /// could compute speculatively.
    pub fn next_speculative(
        &self,
        worker: WorkerId,
        max_claims: usize,
    ) -> Option<Arc<PartialProblemRecord>> {
        let (candidates, start) = {
            let mut st = self.lock();
            if st.in_flight.is_empty() {
                return None;
            }
            let start = st.cursor % st.in_flight.len();
            st.cursor = start + 1;
            let candidates: Vec<_> = st.in_flight.values().cloned().collect();
            (candidates, start)
        };
        let n = candidates.len();
        (0..n)
            .map(|i| &candidates[(start + i) % n])
            .find(|r| r.accepts(worker, max_claims))
            .cloned()
    }

    /// Drop a settled record. Returns whether it was outstanding.
    pub fn evict(&self, id: PartialProblemId) -> bool {
        let mut st = self.lock();
        st.in_flight.shift_remove(&id);
        st.preferred.retain(|r| r.id() != id);
        st.outstanding.remove(&id).is_some()
    }

    pub fn is_outstanding(&self, id: PartialProblemId) -> bool {
        self.lock().outstanding.contains_key(&id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Empty the ledger, returning every record that was still outstanding.
    pub fn drain(&self) -> Vec<Arc<PartialProblemRecord>> {
        self.fresh.clear();
        let mut st = self.lock();
        st.preferred.clear();
        st.in_flight.clear();
        st.cursor = 0;
        st.outstanding.drain().map(|(_, r)| r).collect()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
