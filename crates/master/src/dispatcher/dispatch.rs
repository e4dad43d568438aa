use std::sync::Arc;

use tracing::{debug, trace, warn};

use farmhand_core::{Assignment, ErrorKind, TransportError, WorkerId};

use crate::context::ProblemContext;
use crate::ledger::{ClaimOutcome, PartialProblemRecord};

use super::core::{Claim, Departure, Dispatcher, WorkerRecord, WorkerStatus};

/// Where an offered partial problem came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Strategy {
    /// Abandoned by a lost worker; goes before fresh work.
    Preferred,
    /// Taken from the shared queue.
    Fresh,
    /// Already computed elsewhere; duplicated to finish sooner.
    Speculative,
}

pub(super) struct Offer {
    pub(super) record: Arc<PartialProblemRecord>,
    pub(super) ctx: Arc<ProblemContext>,
    pub(super) strategy: Strategy,
}

enum ClaimError {
    /// The record or its problem ended in the meantime.
    Stale,
    /// The worker is busy, parked or removed.
    WorkerUnavailable,
}

enum DeliveryError {
    /// The claim was taken away while sending.
    Revoked,
    Failed(TransportError),
}

impl Dispatcher {
    /// Offer the worker its next partial problem, or park it when there is none.
    pub async fn dispatch(self: &Arc<Self>, worker: &Arc<WorkerRecord>) {
        let _round = worker.delivery.lock().await;
        loop {
            if self.is_shutting_down() {
                return;
            }
            {
                let slot = worker.slot();
                if slot.status != WorkerStatus::Active || slot.claim.is_some() {
                    return;
                }
            }

            let Some(offer) = self.select_work(worker.id()) else {
                self.park(worker);
                return;
            };
            match self.claim(worker, &offer) {
                Ok(()) => {}
                Err(ClaimError::Stale) => {
                    trace!(partial = %offer.record.key(), "skipping stale offer");
                    continue;
                }
                Err(ClaimError::WorkerUnavailable) => {
                    self.give_back(offer);
                    return;
                }
            }

            match self.deliver(worker, &offer).await {
                Ok(()) => {
                    self.stats.record_dispatch();
                    debug!(
                        worker = %worker.id(),
                        partial = %offer.record.key(),
                        strategy = ?offer.strategy,
                        "partial problem dispatched"
                    );
                    return;
                }
                Err(DeliveryError::Revoked) => return,
                Err(DeliveryError::Failed(err)) => {
                    // A worker that still answers probes is healthy, so the
                    // partial problem or its storage is at fault.
                    if self.liveness.probe(worker.handle().as_ref()).await {
                        self.withdraw(worker, &offer.record);
                        self.abort_problem(
                            offer.ctx.id(),
                            ErrorKind::PartialProblemSendFailed,
                            format!("delivery of {} to {} failed: {}", offer.record.key(), worker.id(), err),
                        );
                        continue;
                    }
                    self.remove_worker(worker.id(), Departure::Unreachable);
                    return;
                }
            }
        }
    }

    /// Start a dispatch round on its own task.
    pub(super) fn spawn_dispatch(self: &Arc<Self>, worker: Arc<WorkerRecord>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.dispatch(&worker).await;
        });
    }

    /// Dispatch inline or on a separate task, depending on configuration.
    pub(super) async fn redispatch(self: &Arc<Self>, worker: &Arc<WorkerRecord>) {
        if self.config.dispatch.spawn_dispatch {
            self.spawn_dispatch(worker.clone());
        } else {
            self.dispatch(worker).await;
        }
    }

    /// Preferred records first, then the shared queue, then speculation.
    fn select_work(&self, worker: WorkerId) -> Option<Offer> {
        let problems = self.running_problems();

        for ctx in &problems {
            if let Some(record) = ctx.ledger().take_preferred() {
                return Some(Offer { record, ctx: ctx.clone(), strategy: Strategy::Preferred });
            }
        }

        while let Some(record) = self.shared.try_take() {
            match record.owner() {
                Some(ctx) if !ctx.is_terminated() && ctx.ledger().is_outstanding(record.id()) => {
                    return Some(Offer { record, ctx, strategy: Strategy::Fresh });
                }
                _ => trace!(partial = %record.key(), "dropping stale queued partial problem"),
            }
        }

        if self.config.dispatch.speculative {
            let max = self.config.dispatch.max_claims_per_partial;
            for ctx in &problems {
                if ctx.is_terminated() {
                    continue;
                }
                if let Some(record) = ctx.ledger().next_speculative(worker, max) {
                    return Some(Offer { record, ctx: ctx.clone(), strategy: Strategy::Speculative });
                }
            }
        }
        None
    }

    /// Record the assignment before anything is sent, so a result or a
    /// worker loss can never race ahead of the bookkeeping.
    fn claim(&self, worker: &WorkerRecord, offer: &Offer) -> Result<(), ClaimError> {
        let outcome = {
            let mut slot = worker.slot();
            if slot.status != WorkerStatus::Active || slot.claim.is_some() {
                return Err(ClaimError::WorkerUnavailable);
            }
            if offer.ctx.is_terminated() {
                return Err(ClaimError::Stale);
            }
            let outcome = offer
                .record
                .try_claim(worker.id(), self.config.dispatch.max_claims_per_partial);
            if outcome == ClaimOutcome::Rejected {
                return Err(ClaimError::Stale);
            }
            slot.claim = Some(Claim { record: offer.record.clone(), ctx: offer.ctx.clone() });
            offer.ctx.retain_reference();
            outcome
        };

        offer.ctx.ledger().mark_in_flight(&offer.record);
        offer.ctx.stats().worker_started();
        if outcome == ClaimOutcome::Additional {
            offer.ctx.stats().record_speculative();
        }
        Ok(())
    }

    /// Put an unclaimed offer back so another worker can take it.
    fn give_back(self: &Arc<Self>, offer: Offer) {
        if offer.strategy == Strategy::Speculative || offer.ctx.is_terminated() {
            return;
        }
        if offer.ctx.ledger().push_preferred(offer.record) {
            self.wake_passive();
        }
    }

    /// Send the assignment, retrying communication failures with a fixed backoff.
    async fn deliver(&self, worker: &WorkerRecord, offer: &Offer) -> Result<(), DeliveryError> {
        let assignment = Assignment {
            key: offer.record.key(),
            partial_problem: offer.record.partial_problem().clone(),
        };
        let storage = offer.ctx.storage_descriptor();
        let attempts = self.config.dispatch.max_send_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if !worker.holds(&offer.record) {
                return Err(DeliveryError::Revoked);
            }
            match worker
                .handle()
                .fetch_partial_problem(assignment.clone(), storage.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(
                        worker = %worker.id(),
                        partial = %assignment.key,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "delivery attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        self.stats.record_retry();
                        tokio::time::sleep(self.config.dispatch.retry_backoff()).await;
                    }
                }
                Err(e) => {
                    warn!(worker = %worker.id(), partial = %assignment.key, error = %e, "worker refused partial problem");
                    return Err(DeliveryError::Failed(e));
                }
            }
        }
        Err(DeliveryError::Failed(last_error.unwrap_or_else(|| {
            TransportError::Unreachable("no delivery attempt made".into())
        })))
    }

    /// Drop the worker's claim on `record` without re-queueing it.
    fn withdraw(&self, worker: &WorkerRecord, record: &Arc<PartialProblemRecord>) {
        let claim = {
            let mut slot = worker.slot();
            match &slot.claim {
                Some(c) if Arc::ptr_eq(&c.record, record) => slot.claim.take(),
                _ => None,
            }
        };
        if let Some(Claim { record, ctx }) = claim {
            record.release(worker.id());
            ctx.stats().worker_stopped();
            ctx.release_reference();
        }
    }

    /// Take `record` away from a worker that is still computing it, tell the
    /// worker to stop, then offer it new work.
    pub(super) fn revoke(self: &Arc<Self>, worker_id: WorkerId, record: &Arc<PartialProblemRecord>) {
        let Some(worker) = self.worker(worker_id) else {
            return;
        };
        let claim = {
            let mut slot = worker.slot();
            match &slot.claim {
                Some(c) if Arc::ptr_eq(&c.record, record) => slot.claim.take(),
                _ => None,
            }
        };
        let Some(Claim { record, ctx }) = claim else {
            return;
        };
        ctx.stats().worker_stopped();
        debug!(worker = %worker_id, partial = %record.key(), "revoking assignment");

        let key = record.key();
        let this = self.clone();
        tokio::spawn(async move {
            {
                // Never overtake a delivery that is still in progress.
                let _round = worker.delivery.lock().await;
                match worker.assignment() {
                    Some(current) if current != key => {
                        debug!(worker = %worker.id(), partial = %key, current = %current, "worker moved on; stop skipped");
                    }
                    _ => {
                        if let Err(e) = worker.handle().stop_computation(key).await {
                            warn!(worker = %worker.id(), error = %e, "stop request failed");
                        }
                    }
                }
            }
            ctx.release_reference();
            this.dispatch(&worker).await;
        });
    }
}
