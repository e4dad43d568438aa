use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use farmhand_core::config::ClientConfig;
use farmhand_core::{
    ClientHandle, ClientId, ClientNotice, ErrorKind, InfoNotice, ProblemId, ProblemResource,
    SharedStorage, Solution, SubmitError, TransportError,
};

use crate::context::ProblemContext;

use super::core::{Departure, Dispatcher};

/// Deliver a notice to a client, retrying communication failures.
pub(crate) async fn notify_client(
    config: &ClientConfig,
    client: &dyn ClientHandle,
    notice: ClientNotice,
) -> Result<(), TransportError> {
    let attempts = config.max_notify_attempts.max(1);
    let mut attempt = 1;
    loop {
        match client.notify(notice.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(client = %client.id(), attempt, error = %e, "client notification failed, retrying");
                attempt += 1;
                tokio::time::sleep(config.retry_backoff()).await;
            }
            Err(e) => return Err(e),
        }
    }
}

impl Dispatcher {
    /// Enter a new problem into the table. The caller starts its driver.
    pub fn accept_problem(
        &self,
        client: Arc<dyn ClientHandle>,
        storage: Option<Arc<dyn SharedStorage>>,
        resources: Vec<Box<dyn ProblemResource>>,
    ) -> Result<Arc<ProblemContext>, SubmitError> {
        if self.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }
        if self.registered_workers() == 0 {
            return Err(SubmitError::NoWorkers);
        }
        let client_id = client.id();
        let ctx = {
            let mut table = self.table();
            if table.by_client.contains_key(&client_id) {
                return Err(SubmitError::ClientBusy(client_id.to_string()));
            }
            let ctx = ProblemContext::new(client, storage, resources);
            table.by_client.insert(client_id, ctx.id());
            table.by_id.insert(ctx.id(), ctx.clone());
            ctx
        };
        info!(problem = %ctx.id(), client = %client_id, "problem accepted");
        Ok(ctx)
    }

    /// Remove a problem from the table. Only the first caller gets it back,
    /// which makes every way of ending a problem happen at most once.
    fn detach_problem(&self, id: ProblemId) -> Option<Arc<ProblemContext>> {
        let mut table = self.table();
        let ctx = table.by_id.shift_remove(&id)?;
        if table.by_client.get(&ctx.client_id()) == Some(&id) {
            table.by_client.remove(&ctx.client_id());
        }
        Some(ctx)
    }

    /// Abort a running problem and tell its client. Returns `false` if the
    /// problem had already ended.
    pub fn abort_problem(&self, id: ProblemId, kind: ErrorKind, message: impl Into<String>) -> bool {
        let Some(ctx) = self.detach_problem(id) else {
            debug!(problem = %id, %kind, "abort ignored: problem already ended");
            return false;
        };
        let message = message.into();
        ctx.terminate();
        self.stats.record_problem_aborted();

        let notice = if kind == ErrorKind::UserAbort {
            info!(problem = %id, "problem aborted by client");
            ClientNotice::Aborted { problem: id }
        } else {
            warn!(problem = %id, %kind, error = %message, "problem aborted");
            ClientNotice::Failed { problem: id, kind, message }
        };
        self.spawn_notify(ctx.client().clone(), notice);
        true
    }

    /// Abort whatever problem the client is running.
    pub fn abort_client(&self, client: ClientId) -> bool {
        let problem = self.table().by_client.get(&client).copied();
        match problem {
            Some(id) => self.abort_problem(id, ErrorKind::UserAbort, "aborted by client"),
            None => false,
        }
    }

    /// Hand the final solution to the client, unless the problem was aborted first.
    pub async fn finish_problem(&self, ctx: &Arc<ProblemContext>, solution: Solution) {
        if self.detach_problem(ctx.id()).is_none() {
            debug!(problem = %ctx.id(), "solution dropped: problem already ended");
            return;
        }
        ctx.terminate();
        self.stats.record_problem_solved();
        let statistics = ctx.statistics();
        info!(
            problem = %ctx.id(),
            generated = statistics.generated,
            solved = statistics.solved,
            age_ms = statistics.age_ms,
            "problem solved"
        );

        let notice = ClientNotice::Solved { problem: ctx.id(), solution, statistics };
        if let Err(e) = notify_client(&self.config.client, ctx.client().as_ref(), notice).await {
            error!(
                problem = %ctx.id(),
                kind = %ErrorKind::SolutionSendFailed,
                error = %e,
                "could not deliver solution to client"
            );
        }
    }

    /// Tear down a problem whose driver has stopped: pull its work out of
    /// every queue, stop the workers still computing it, wait until none
    /// references it, then release its resources.
    pub async fn retire_problem(self: &Arc<Self>, ctx: &Arc<ProblemContext>) {
        self.detach_problem(ctx.id());
        let id = ctx.id();
        let queued = self.shared.remove_where(|r| r.problem() == id).len();

        let records = ctx.ledger().drain();
        let mut revoked = 0;
        for record in &records {
            let (claimants, spent) = record.revoke_all();
            ctx.stats().record_aborted(spent);
            for worker in claimants {
                self.revoke(worker, record);
                revoked += 1;
            }
        }
        ctx.solutions().clear();
        debug!(problem = %id, queued, outstanding = records.len(), revoked, "problem retired");

        let timeout = self.config.shutdown.release_timeout();
        if !ctx.wait_released(timeout).await {
            warn!(
                problem = %id,
                references = ctx.references(),
                ?timeout,
                "workers still reference problem, releasing resources anyway"
            );
        }
        ctx.release_resources();
    }

    pub(super) fn spawn_notify(&self, client: Arc<dyn ClientHandle>, notice: ClientNotice) {
        let config = self.config.client.clone();
        tokio::spawn(async move {
            if let Err(e) = notify_client(&config, client.as_ref(), notice).await {
                warn!(client = %client.id(), error = %e, "client notification dropped");
            }
        });
    }

    /// Tell every client with a running problem.
    pub(super) fn broadcast(&self, info: InfoNotice) {
        let clients: Vec<_> = self.table().by_id.values().map(|ctx| ctx.client().clone()).collect();
        if clients.is_empty() {
            return;
        }
        info!(notice = ?info, clients = clients.len(), "broadcasting to clients");
        for client in clients {
            self.spawn_notify(client, ClientNotice::Info(info));
        }
    }

    /// Abort every problem with `DispatcherShutdown` and send every worker away.
    pub async fn shutdown(self: &Arc<Self>) {
        if !self.begin_shutdown() {
            return;
        }
        let problems = self.running_problems();
        info!(problems = problems.len(), workers = self.registered_workers(), "dispatcher shutting down");
        for ctx in &problems {
            self.abort_problem(ctx.id(), ErrorKind::DispatcherShutdown, "dispatcher shutting down");
        }

        let workers = self.all_workers();
        for worker in &workers {
            self.remove_worker(worker.id(), Departure::Shutdown);
        }
        let timeout = self.config.liveness.probe_timeout();
        join_all(workers.iter().map(|w| async move {
            match tokio::time::timeout(timeout, w.handle().shutdown_now()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(worker = %w.id(), error = %e, "shutdown request failed"),
                Err(_) => debug!(worker = %w.id(), "shutdown request timed out"),
            }
        }))
        .await;
    }
}
