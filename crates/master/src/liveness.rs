//! Periodic reachability probing of registered workers.
//!
//! The monitor only detects; workers found unreachable are reported on a
//! channel and removed by the dispatcher, so a dead worker's claimed work is
//! re-queued the same way whether the loss was noticed here or during a send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use farmhand_core::config::LivenessConfig;
use farmhand_core::{WorkerHandle, WorkerId};

pub struct LivenessMonitor {
    watched: Mutex<HashMap<WorkerId, Arc<dyn WorkerHandle>>>,
    interval: Duration,
    probe_timeout: Duration,
    membership_changed: Notify,
}

impl LivenessMonitor {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            watched: Mutex::new(HashMap::new()),
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            membership_changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, Arc<dyn WorkerHandle>>> {
        self.watched.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn watch(&self, handle: Arc<dyn WorkerHandle>) {
        self.lock().insert(handle.id(), handle);
        self.membership_changed.notify_one();
    }

    pub fn unwatch(&self, id: WorkerId) {
        if self.lock().remove(&id).is_some() {
            self.membership_changed.notify_one();
        }
    }

    pub fn watched(&self) -> usize {
        self.lock().len()
    }

    /// One reachability probe, bounded by the probe timeout.
    pub async fn probe(&self, handle: &dyn WorkerHandle) -> bool {
        tokio::time::timeout(self.probe_timeout, handle.is_reachable())
            .await
            .unwrap_or(false)
    }

    /// Probe every watched worker concurrently and return the ones that did
    /// not answer and are still watched.
    pub async fn sweep(&self) -> Vec<WorkerId> {
        let handles: Vec<_> = self.lock().values().cloned().collect();
        let results = join_all(handles.iter().map(|h| async move {
            (h.id(), self.probe(h.as_ref()).await)
        }))
        .await;

        let watched = self.lock();
        results
            .into_iter()
            .filter(|(id, reachable)| !reachable && watched.contains_key(id))
            .map(|(id, _)| id)
            .collect()
    }

    /// Run the probe loop until `shutdown` flips to `true`. Unreachable
    /// workers are unwatched and sent on `lost`.
    pub fn spawn(
        self: Arc<Self>,
        lost: mpsc::UnboundedSender<WorkerId>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "liveness monitor started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                if self.watched() == 0 {
                    // Nothing to probe; sleep until a worker registers.
                    tokio::select! {
                        _ = self.membership_changed.notified() => continue,
                        res = shutdown.changed() => {
                            if res.is_err() { break; }
                            continue;
                        }
                    }
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    res = shutdown.changed() => {
                        if res.is_err() { break; }
                        continue;
                    }
                }

                let dead = self.sweep().await;
                debug!(watched = self.watched(), unreachable = dead.len(), "liveness sweep");
                for id in dead {
                    warn!(worker = %id, "worker failed liveness probe");
                    self.unwatch(id);
                    if lost.send(id).is_err() {
                        return;
                    }
                }
            }
            info!("liveness monitor stopped");
        })
    }
}
