//! In-process worker and client handles.
//!
//! [`LocalWorker`] computes partial problems on the tokio runtime and reports
//! back straight into the dispatcher; [`ChannelClient`] forwards notices to an
//! mpsc channel. Together they run a master without any network transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use farmhand_core::{
    Assignment, AssignmentKey, ClientHandle, ClientId, ClientNotice, ErrorKind, PartialProblem,
    PartialSolution, StorageDescriptor, TransportError, WorkerHandle, WorkerId,
};

use crate::dispatcher::Dispatcher;

/// Computes one partial problem.
pub type ComputeFn = Arc<dyn Fn(&PartialProblem) -> anyhow::Result<PartialSolution> + Send + Sync>;

#[derive(Default)]
struct Running {
    current: Option<(AssignmentKey, JoinHandle<()>)>,
}

pub struct LocalWorker {
    id: WorkerId,
    dispatcher: Weak<Dispatcher>,
    compute: ComputeFn,
    delay: Duration,
    reachable: Arc<AtomicBool>,
    running: Arc<Mutex<Running>>,
    accepted: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl LocalWorker {
    pub fn new(
        dispatcher: &Arc<Dispatcher>,
        compute: impl Fn(&PartialProblem) -> anyhow::Result<PartialSolution> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: WorkerId::new(),
            dispatcher: Arc::downgrade(dispatcher),
            compute: Arc::new(compute),
            delay: Duration::ZERO,
            reachable: Arc::new(AtomicBool::new(true)),
            running: Arc::new(Mutex::new(Running::default())),
            accepted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulated compute time per partial problem.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Take the worker off the network (or bring it back). An unreachable
    /// worker refuses deliveries, fails probes and never reports results.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<AssignmentKey> {
        self.lock().current.as_ref().map(|(key, _)| *key)
    }

    fn lock(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop(&self) -> Option<AssignmentKey> {
        let (key, handle) = self.lock().current.take()?;
        handle.abort();
        Some(key)
    }

    /// Abort the running computation only if it is the one for `key`.
    fn stop_matching(&self, key: AssignmentKey) -> bool {
        let mut running = self.lock();
        if !matches!(&running.current, Some((k, _)) if *k == key) {
            return false;
        }
        if let Some((_, handle)) = running.current.take() {
            handle.abort();
        }
        true
    }
}

#[async_trait]
impl WorkerHandle for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn fetch_partial_problem(
        &self,
        assignment: Assignment,
        _storage: Option<StorageDescriptor>,
    ) -> Result<(), TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(format!("{} is offline", self.id)));
        }
        let mut running = self.lock();
        if running.current.is_some() {
            return Err(TransportError::AlreadyBusy);
        }

        let id = self.id;
        let key = assignment.key;
        let delay = self.delay;
        let compute = self.compute.clone();
        let dispatcher = self.dispatcher.clone();
        let reachable = self.reachable.clone();
        let slot = self.running.clone();
        let completed = self.completed.clone();

        // The task clears `current` under the same lock, so it cannot finish
        // before the handle is stored.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = compute(&assignment.partial_problem);
            {
                let mut running = slot.lock().unwrap_or_else(|e| e.into_inner());
                if !matches!(&running.current, Some((k, _)) if *k == key) {
                    return;
                }
                running.current = None;
            }
            if !reachable.load(Ordering::SeqCst) {
                return;
            }
            let Some(dispatcher) = dispatcher.upgrade() else {
                return;
            };
            completed.fetch_add(1, Ordering::SeqCst);
            let reported = match result {
                Ok(solution) => dispatcher.return_solution(id, key, solution).await,
                Err(e) => {
                    dispatcher
                        .report_failure(id, key, ErrorKind::PartialProblemComputeFailed, format!("{e:#}"))
                        .await
                }
            };
            if let Err(e) = reported {
                debug!(worker = %id, partial = %key, error = %e, "result not accepted");
            }
        });
        running.current = Some((key, handle));
        drop(running);

        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_computation(&self, key: AssignmentKey) -> Result<(), TransportError> {
        if self.stop_matching(key) {
            debug!(worker = %self.id, partial = %key, "computation stopped");
        } else {
            debug!(worker = %self.id, partial = %key, "stale stop request ignored");
        }
        Ok(())
    }

    async fn deregister(&self) -> Result<(), TransportError> {
        self.stop();
        Ok(())
    }

    async fn shutdown_now(&self) -> Result<(), TransportError> {
        self.stop();
        self.set_reachable(false);
        Ok(())
    }
}

/// Client handle that forwards every notice to a channel.
pub struct ChannelClient {
    id: ClientId,
    tx: mpsc::UnboundedSender<ClientNotice>,
}

impl ChannelClient {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { id: ClientId::new(), tx }), rx)
    }
}

#[async_trait]
impl ClientHandle for ChannelClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn notify(&self, notice: ClientNotice) -> Result<(), TransportError> {
        self.tx.send(notice).map_err(|_| {
            warn!(client = %self.id, "client channel closed");
            TransportError::Unreachable(format!("{} is gone", self.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmhand_core::{MasterConfig, PartialProblemId, ProblemId};

    fn assignment(partial: u64) -> Assignment {
        Assignment {
            key: AssignmentKey { problem: ProblemId::new(), partial: PartialProblemId(partial) },
            partial_problem: PartialProblem::encode(&partial).unwrap(),
        }
    }

    #[tokio::test]
    async fn stop_for_another_key_is_ignored() {
        let dispatcher = Dispatcher::new(MasterConfig::default());
        let worker = LocalWorker::new(&dispatcher, |_| Ok(PartialSolution::encode(&0u32)?))
            .with_delay(Duration::from_secs(60));
        let running = assignment(2);
        let key = running.key;
        worker.fetch_partial_problem(running, None).await.unwrap();

        let stale = AssignmentKey { partial: PartialProblemId(1), ..key };
        worker.stop_computation(stale).await.unwrap();
        assert_eq!(worker.current(), Some(key));

        worker.stop_computation(key).await.unwrap();
        assert_eq!(worker.current(), None);
    }
}
