use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use farmhand_core::{
    AssignmentKey, ClientId, FarmhandError, InfoNotice, MasterConfig, PartialProblemId,
    ProblemId, ProblemStatistics, SubmitError, SystemStatistics, WorkerHandle, WorkerId,
};

use crate::context::ProblemContext;
use crate::ledger::{PartialProblemRecord, ReleaseOutcome};
use crate::liveness::LivenessMonitor;
use crate::queue::WorkQueue;
use crate::stats::SystemStats;

/// Where a registered worker currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Computing, or about to be offered work.
    Active,
    /// Idle; woken when new work shows up.
    Passive,
    Removed,
}

/// Why a worker left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Deregistered,
    Unreachable,
    Shutdown,
}

/// A worker's hold on one partial problem.
pub(super) struct Claim {
    pub(super) record: Arc<PartialProblemRecord>,
    pub(super) ctx: Arc<ProblemContext>,
}

pub(super) struct WorkerSlot {
    pub(super) status: WorkerStatus,
    pub(super) claim: Option<Claim>,
}

/// A registered worker and its single assignment slot.
pub struct WorkerRecord {
    id: WorkerId,
    handle: Arc<dyn WorkerHandle>,
    slot: Mutex<WorkerSlot>,
    /// Serializes dispatch rounds and stop requests of this worker.
    pub(super) delivery: tokio::sync::Mutex<()>,
}

impl WorkerRecord {
    fn new(handle: Arc<dyn WorkerHandle>) -> Self {
        Self {
            id: handle.id(),
            handle,
            slot: Mutex::new(WorkerSlot {
                status: WorkerStatus::Active,
                claim: None,
            }),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn handle(&self) -> &Arc<dyn WorkerHandle> {
        &self.handle
    }

    pub(super) fn slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> WorkerStatus {
        self.slot().status
    }

    pub fn assignment(&self) -> Option<AssignmentKey> {
        self.slot().claim.as_ref().map(|c| c.record.key())
    }

    pub(super) fn holds(&self, record: &Arc<PartialProblemRecord>) -> bool {
        matches!(&self.slot().claim, Some(c) if Arc::ptr_eq(&c.record, record))
    }
}

#[derive(Default)]
pub(super) struct Membership {
    pub(super) active: IndexMap<WorkerId, Arc<WorkerRecord>>,
    pub(super) passive: IndexMap<WorkerId, Arc<WorkerRecord>>,
}

impl Membership {
    fn get(&self, id: &WorkerId) -> Option<&Arc<WorkerRecord>> {
        self.active.get(id).or_else(|| self.passive.get(id))
    }

    fn len(&self) -> usize {
        self.active.len() + self.passive.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub(super) struct ProblemTable {
    pub(super) by_id: IndexMap<ProblemId, Arc<ProblemContext>>,
    pub(super) by_client: HashMap<ClientId, ProblemId>,
}

/// Worker registry, assignment bookkeeping and problem table of a master.
///
/// Lock order: worker slot, then record claims, then one collection lock
/// (membership, problem table or a ledger). Std locks are never held across
/// an await; the per-worker `delivery` lock is the only one that is.
pub struct Dispatcher {
    pub(super) config: MasterConfig,
    pub(super) workers: Mutex<Membership>,
    pub(super) problems: Mutex<ProblemTable>,
    /// Fresh partial problems picked by the collector, waiting for a worker.
    pub(super) shared: WorkQueue<Arc<PartialProblemRecord>>,
    /// Signalled when a problem's fresh queue goes from empty to non-empty.
    pub(super) work_available: Notify,
    pub(super) liveness: Arc<LivenessMonitor>,
    pub(super) stats: SystemStats,
    next_partial: AtomicU64,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: MasterConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: WorkQueue::new(config.queue.shared_capacity),
            liveness: Arc::new(LivenessMonitor::new(&config.liveness)),
            config,
            workers: Mutex::new(Membership::default()),
            problems: Mutex::new(ProblemTable::default()),
            work_available: Notify::new(),
            stats: SystemStats::new(),
            next_partial: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    pub(super) fn members(&self) -> MutexGuard<'_, Membership> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn table(&self) -> MutexGuard<'_, ProblemTable> {
        self.problems.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn worker(&self, id: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.members().get(&id).cloned()
    }

    pub(super) fn all_workers(&self) -> Vec<Arc<WorkerRecord>> {
        let m = self.members();
        m.active.values().chain(m.passive.values()).cloned().collect()
    }

    pub fn registered_workers(&self) -> usize {
        self.members().len()
    }

    pub fn running_problems(&self) -> Vec<Arc<ProblemContext>> {
        self.table().by_id.values().cloned().collect()
    }

    pub fn problem(&self, id: ProblemId) -> Option<Arc<ProblemContext>> {
        self.table().by_id.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn insert_problem_for_test(&self, ctx: Arc<ProblemContext>) {
        let mut table = self.table();
        table.by_client.insert(ctx.client_id(), ctx.id());
        table.by_id.insert(ctx.id(), ctx);
    }

    pub fn next_partial_id(&self) -> PartialProblemId {
        PartialProblemId(self.next_partial.fetch_add(1, Ordering::Relaxed))
    }

    /// How many partial problems one problem may have outstanding.
    pub fn outstanding_limit(&self) -> usize {
        self.config.throttle.limit(self.registered_workers())
    }

    /// Generation hint: registered workers per running problem, at least 1.
    pub fn batch_hint(&self) -> usize {
        let workers = self.registered_workers() as f64;
        let problems = self.table().by_id.len().max(1) as f64;
        ((workers / problems).round() as usize).max(1)
    }

    /// Called by drivers when their fresh queue stops being empty.
    pub fn signal_work(&self) {
        self.work_available.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(super) fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    pub(super) fn wake_drivers(&self) {
        for ctx in self.running_problems() {
            ctx.wake();
        }
    }

    /// Whether anything is waiting that a passive worker could pick up.
    fn work_pending(&self) -> bool {
        !self.shared.is_empty() || self.running_problems().iter().any(|ctx| ctx.ledger().has_preferred())
    }

    // ── Registration ──────────────────────────────────────────

    /// Register a worker after a successful reachability probe and offer it work.
    pub async fn register_worker(
        self: &Arc<Self>,
        handle: Arc<dyn WorkerHandle>,
    ) -> Result<WorkerId, FarmhandError> {
        if self.is_shutting_down() {
            return Err(SubmitError::ShuttingDown.into());
        }
        let id = handle.id();
        if !self.liveness.probe(handle.as_ref()).await {
            warn!(worker = %id, "registration refused: worker unreachable");
            return Err(FarmhandError::Unreachable(id.to_string()));
        }

        let worker = Arc::new(WorkerRecord::new(handle.clone()));
        let first = {
            let mut m = self.members();
            if m.get(&id).is_some() {
                debug!(worker = %id, "worker already registered");
                return Ok(id);
            }
            let first = m.is_empty();
            m.active.insert(id, worker.clone());
            first
        };
        self.liveness.watch(handle);
        info!(worker = %id, registered = self.registered_workers(), "worker registered");

        if first {
            self.broadcast(InfoNotice::WorkersAvailableAgain);
        }
        self.wake_drivers();
        self.redispatch(&worker).await;
        Ok(id)
    }

    /// Worker-initiated deregistration.
    pub fn unregister_worker(self: &Arc<Self>, id: WorkerId) -> Result<(), FarmhandError> {
        if self.remove_worker(id, Departure::Deregistered) {
            Ok(())
        } else {
            Err(FarmhandError::UnknownWorker(id.to_string()))
        }
    }

    /// Take a worker out of the registry. Whatever it was computing is
    /// released; a record left without claimants is re-offered before fresh
    /// work. Returns `false` if the worker was not registered.
    pub fn remove_worker(self: &Arc<Self>, id: WorkerId, departure: Departure) -> bool {
        let Some(worker) = self.worker(id) else {
            return false;
        };
        let (claim, now_empty) = {
            let mut slot = worker.slot();
            if slot.status == WorkerStatus::Removed {
                return false;
            }
            slot.status = WorkerStatus::Removed;
            let claim = slot.claim.take();
            let mut m = self.members();
            m.active.shift_remove(&id);
            m.passive.shift_remove(&id);
            (claim, m.is_empty())
        };
        self.liveness.unwatch(id);

        let abandoned = claim.as_ref().map(|c| c.record.key());
        if let Some(claim) = claim {
            self.abandon_claim(id, claim);
        }
        match departure {
            Departure::Unreachable => {
                self.stats.record_worker_lost();
                warn!(worker = %id, abandoned = ?abandoned, "worker lost");
                // A worker that only missed a probe may still be alive.
                let timeout = self.config.liveness.probe_timeout();
                let handle = worker.handle().clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, handle.deregister()).await {
                        Ok(Ok(())) => debug!(worker = %id, "deregistration delivered"),
                        Ok(Err(e)) => debug!(worker = %id, error = %e, "deregistration failed"),
                        Err(_) => debug!(worker = %id, "deregistration timed out"),
                    }
                });
            }
            _ => info!(worker = %id, reason = ?departure, abandoned = ?abandoned, "worker removed"),
        }

        if now_empty && !self.is_shutting_down() {
            self.broadcast(InfoNotice::NoWorkersRegistered);
        }
        self.wake_drivers();
        true
    }

    /// Release a claim whose worker is gone without reporting back.
    pub(super) fn abandon_claim(self: &Arc<Self>, worker: WorkerId, claim: Claim) {
        let Claim { record, ctx } = claim;
        ctx.stats().worker_stopped();
        let outcome = record.release(worker);
        ctx.release_reference();

        if let ReleaseOutcome::LastClaimant(spent) = outcome {
            if ctx.is_terminated() {
                return;
            }
            ctx.stats().record_aborted(spent);
            if ctx.ledger().push_preferred(record.clone()) {
                debug!(partial = %record.key(), "re-queued abandoned partial problem");
                self.wake_passive();
            }
        }
    }

    // ── Active / passive transitions ──────────────────────────

    /// Move an idle worker to the passive set.
    pub(super) fn park(self: &Arc<Self>, worker: &Arc<WorkerRecord>) {
        {
            let mut slot = worker.slot();
            if slot.status != WorkerStatus::Active || slot.claim.is_some() {
                return;
            }
            slot.status = WorkerStatus::Passive;
            let mut m = self.members();
            if let Some(w) = m.active.shift_remove(&worker.id) {
                m.passive.insert(worker.id, w);
            }
        }
        debug!(worker = %worker.id, "worker passive");
        // Work may have arrived between the failed lookup and parking.
        if self.work_pending() {
            self.wake_passive();
        }
    }

    /// Activate one passive worker and start a dispatch round for it.
    pub(super) fn wake_passive(self: &Arc<Self>) {
        let candidates: Vec<_> = self.members().passive.values().cloned().collect();
        for worker in candidates {
            let activated = {
                let mut slot = worker.slot();
                if slot.status == WorkerStatus::Passive {
                    slot.status = WorkerStatus::Active;
                    let mut m = self.members();
                    if let Some(w) = m.passive.shift_remove(&worker.id) {
                        m.active.insert(worker.id, w);
                    }
                    true
                } else {
                    false
                }
            };
            if activated {
                debug!(worker = %worker.id, "waking passive worker");
                self.spawn_dispatch(worker);
                return;
            }
        }
    }

    // ── Statistics ────────────────────────────────────────────

    pub fn system_statistics(&self) -> SystemStatistics {
        let (active, passive) = {
            let m = self.members();
            (m.active.len(), m.passive.len())
        };
        let running = self.table().by_id.len();
        self.stats.snapshot(active, passive, running)
    }

    pub fn problem_statistics(&self, id: ProblemId) -> Option<ProblemStatistics> {
        self.problem(id).map(|ctx| ctx.statistics())
    }

    pub fn all_problem_statistics(&self) -> Vec<ProblemStatistics> {
        self.running_problems().iter().map(|ctx| ctx.statistics()).collect()
    }
}
