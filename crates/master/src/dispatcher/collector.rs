use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, trace};

use crate::ledger::PartialProblemRecord;
use crate::selection;

use super::core::Dispatcher;

impl Dispatcher {
    /// Move fresh work from the per-problem queues into the shared queue,
    /// most urgent problem first, until `shutdown` flips to `true`.
    pub fn spawn_collector(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(capacity = this.shared.capacity(), "work collector started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let signal = this.work_available.notified();
                tokio::pin!(signal);
                signal.as_mut().enable();

                match this.collect_next() {
                    Some(record) => {
                        trace!(partial = %record.key(), "queueing partial problem");
                        tokio::select! {
                            enqueued = this.shared.put(record) => {
                                if enqueued {
                                    this.wake_passive();
                                }
                            }
                            res = shutdown.changed() => {
                                if res.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = &mut signal => {}
                            res = shutdown.changed() => {
                                if res.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!("work collector stopped");
        })
    }

    fn collect_next(&self) -> Option<Arc<PartialProblemRecord>> {
        loop {
            let problems = self.running_problems();
            let ctx = selection::select_next(&problems)?;
            if let Some(record) = ctx.ledger().take_fresh() {
                return Some(record);
            }
            // Everything queued for that problem was settled meanwhile; look again.
        }
    }
}
