use std::sync::Arc;

use tracing::{debug, warn};

use farmhand_core::{AssignmentKey, ErrorKind, FarmhandError, PartialSolution, WorkerId};

use crate::ledger::Settlement;

use super::core::{Claim, Dispatcher, WorkerRecord};

impl Dispatcher {
    /// A worker finished `key`. The first report for a partial problem is
    /// forwarded to its driver; later ones are counted and dropped. The
    /// reporting worker is offered new work either way.
    pub async fn return_solution(
        self: &Arc<Self>,
        worker_id: WorkerId,
        key: AssignmentKey,
        solution: PartialSolution,
    ) -> Result<(), FarmhandError> {
        let worker = self
            .worker(worker_id)
            .ok_or_else(|| FarmhandError::UnknownWorker(worker_id.to_string()))?;

        if let Some(Claim { record, ctx }) = self.take_reported_claim(&worker, key) {
            match record.settle(worker_id) {
                Settlement::Won { others, duration } => {
                    ctx.ledger().evict(record.id());
                    ctx.stats().record_solved(duration);
                    for other in others {
                        self.revoke(other, &record);
                    }
                    debug!(worker = %worker_id, partial = %key, ?duration, "partial solution accepted");
                    if !ctx.is_terminated() {
                        ctx.solutions().put((record.clone(), solution)).await;
                    }
                }
                Settlement::Lost => {
                    ctx.stats().record_duplicate();
                    debug!(worker = %worker_id, partial = %key, "late duplicate result dropped");
                }
            }
            ctx.stats().worker_stopped();
            ctx.release_reference();
        }

        self.redispatch(&worker).await;
        Ok(())
    }

    /// A worker could not compute `key`. Wins like a solution would and, if
    /// it does, aborts the whole problem with `kind`.
    pub async fn report_failure(
        self: &Arc<Self>,
        worker_id: WorkerId,
        key: AssignmentKey,
        kind: ErrorKind,
        message: String,
    ) -> Result<(), FarmhandError> {
        let worker = self
            .worker(worker_id)
            .ok_or_else(|| FarmhandError::UnknownWorker(worker_id.to_string()))?;

        if let Some(Claim { record, ctx }) = self.take_reported_claim(&worker, key) {
            match record.settle(worker_id) {
                Settlement::Won { others, .. } => {
                    ctx.ledger().evict(record.id());
                    for other in others {
                        self.revoke(other, &record);
                    }
                    warn!(worker = %worker_id, partial = %key, %kind, error = %message, "partial problem failed");
                    self.abort_problem(ctx.id(), kind, message);
                }
                Settlement::Lost => {
                    ctx.stats().record_duplicate();
                    debug!(worker = %worker_id, partial = %key, "failure for settled partial problem ignored");
                }
            }
            ctx.stats().worker_stopped();
            ctx.release_reference();
        }

        self.redispatch(&worker).await;
        Ok(())
    }

    /// Take the worker's claim if it matches the reported key. Reports for
    /// anything else were revoked already.
    fn take_reported_claim(&self, worker: &WorkerRecord, key: AssignmentKey) -> Option<Claim> {
        let claim = {
            let mut slot = worker.slot();
            match &slot.claim {
                Some(c) if c.record.key() == key => slot.claim.take(),
                _ => None,
            }
        };
        if claim.is_none() {
            if let Some(ctx) = self.problem(key.problem) {
                ctx.stats().record_duplicate();
            }
            debug!(worker = %worker.id(), partial = %key, "report for revoked assignment ignored");
        }
        claim
    }
}
