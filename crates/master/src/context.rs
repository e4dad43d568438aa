//! Shared state of one running problem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use farmhand_core::{
    ClientHandle, ClientId, PartialSolution, ProblemId, ProblemResource, ProblemStatistics,
    SharedStorage, StorageDescriptor,
};

use crate::ledger::{Ledger, PartialProblemRecord};
use crate::queue::WorkQueue;
use crate::stats::ProblemStats;

/// A settled record together with the winning result, waiting to be folded.
pub type ReturnedSolution = (Arc<PartialProblemRecord>, PartialSolution);

/// State shared between a problem's driver and the dispatcher.
///
/// The driver owns the user's `Problem` value; everything the dispatcher
/// needs to hand out work and route results back lives here.
pub struct ProblemContext {
    id: ProblemId,
    client: Arc<dyn ClientHandle>,
    ledger: Ledger,
    stats: Arc<ProblemStats>,
    storage: Option<Arc<dyn SharedStorage>>,
    resources: Mutex<Vec<Box<dyn ProblemResource>>>,
    solutions: WorkQueue<ReturnedSolution>,
    /// Wakes the driver: worker count changed, or the problem was terminated.
    wake: Notify,
    terminated: AtomicBool,
    /// Workers currently holding an assignment of this problem.
    references: Mutex<usize>,
    released: Notify,
    resources_released: AtomicBool,
}

impl ProblemContext {
    pub fn new(
        client: Arc<dyn ClientHandle>,
        storage: Option<Arc<dyn SharedStorage>>,
        resources: Vec<Box<dyn ProblemResource>>,
    ) -> Arc<Self> {
        let id = ProblemId::new();
        Arc::new(Self {
            id,
            stats: Arc::new(ProblemStats::new(id, client.id())),
            client,
            ledger: Ledger::new(),
            storage,
            resources: Mutex::new(resources),
            solutions: WorkQueue::unbounded(),
            wake: Notify::new(),
            terminated: AtomicBool::new(false),
            references: Mutex::new(0),
            released: Notify::new(),
            resources_released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ProblemId {
        self.id
    }

    pub fn client(&self) -> &Arc<dyn ClientHandle> {
        &self.client
    }

    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn stats(&self) -> &Arc<ProblemStats> {
        &self.stats
    }

    pub fn storage_descriptor(&self) -> Option<StorageDescriptor> {
        self.storage.as_ref().map(|s| s.descriptor())
    }

    pub fn solutions(&self) -> &WorkQueue<ReturnedSolution> {
        &self.solutions
    }

    pub fn statistics(&self) -> ProblemStatistics {
        self.stats.snapshot(self.ledger.outstanding_count())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Mark the problem as ended and wake its driver. Returns `true` for the
    /// first call only.
    pub fn terminate(&self) -> bool {
        let first = !self.terminated.swap(true, Ordering::AcqRel);
        self.wake.notify_one();
        first
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn wake_signal(&self) -> &Notify {
        &self.wake
    }

    fn refs(&self) -> MutexGuard<'_, usize> {
        self.references.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn retain_reference(&self) {
        *self.refs() += 1;
    }

    pub fn release_reference(&self) {
        let mut refs = self.refs();
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            drop(refs);
            self.released.notify_waiters();
        }
    }

    pub fn references(&self) -> usize {
        *self.refs()
    }

    /// Wait until no worker references the problem. Returns `false` if the
    /// timeout elapsed first.
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.references() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Tear down shared storage and other per-problem resources. Runs once.
    pub fn release_resources(&self) {
        if self.resources_released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(storage) = &self.storage {
            match storage.release() {
                Ok(()) => debug!(problem = %self.id, "shared storage released"),
                Err(e) => warn!(problem = %self.id, error = %e, "failed to release shared storage"),
            }
        }
        let resources: Vec<_> = {
            let mut guard = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for resource in resources {
            if let Err(e) = resource.release() {
                warn!(
                    problem = %self.id,
                    resource = resource.name(),
                    error = %e,
                    "failed to release problem resource"
                );
            }
        }
    }
}

impl std::fmt::Debug for ProblemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProblemContext")
            .field("id", &self.id)
            .field("client", &self.client.id())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use farmhand_core::{ClientNotice, Payload, TransportError};

    pub(crate) struct SilentClient {
        id: ClientId,
    }

    #[async_trait]
    impl ClientHandle for SilentClient {
        fn id(&self) -> ClientId {
            self.id
        }

        async fn notify(&self, _notice: ClientNotice) -> Result<(), TransportError> {
            Ok(())
        }
    }

    pub(crate) fn test_context() -> Arc<ProblemContext> {
        ProblemContext::new(Arc::new(SilentClient { id: ClientId::new() }), None, Vec::new())
    }

    struct CountingStorage {
        releases: Arc<AtomicUsize>,
    }

    impl SharedStorage for CountingStorage {
        fn descriptor(&self) -> StorageDescriptor {
            StorageDescriptor {
                kind: "memory".into(),
                config: Payload::from_bytes(vec![1, 2, 3]),
            }
        }

        fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingResource;

    impl ProblemResource for FailingResource {
        fn name(&self) -> &str {
            "bundle"
        }

        fn release(&self) -> anyhow::Result<()> {
            anyhow::bail!("already gone")
        }
    }

    #[test]
    fn terminate_is_reported_once() {
        let ctx = test_context();
        assert!(!ctx.is_terminated());
        assert!(ctx.terminate());
        assert!(!ctx.terminate());
        assert!(ctx.is_terminated());
    }

    #[test]
    fn resources_are_released_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let ctx = ProblemContext::new(
            Arc::new(SilentClient { id: ClientId::new() }),
            Some(Arc::new(CountingStorage { releases: releases.clone() })),
            vec![Box::new(FailingResource)],
        );
        assert_eq!(ctx.storage_descriptor().unwrap().kind, "memory");
        ctx.release_resources();
        ctx.release_resources();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_released_follows_references() {
        let ctx = test_context();
        assert!(ctx.wait_released(Duration::from_millis(10)).await);

        ctx.retain_reference();
        assert!(!ctx.wait_released(Duration::from_millis(30)).await);

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_released(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.release_reference();
        assert!(waiter.await.unwrap());
    }
}
