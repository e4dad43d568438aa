//! The master: public entry point tying the dispatcher, drivers and
//! background tasks together.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use farmhand_core::{
    AssignmentKey, ClientHandle, ClientId, ErrorKind, FarmhandError, MasterConfig,
    PartialSolution, Problem, ProblemId, ProblemResource, ProblemStatistics, SharedStorage,
    SystemStatistics, WorkerHandle, WorkerId,
};

use crate::dispatcher::{Departure, Dispatcher};
use crate::driver::Driver;
use crate::http;

/// A problem together with what it needs while running.
pub struct Submission {
    problem: Box<dyn Problem>,
    storage: Option<Arc<dyn SharedStorage>>,
    resources: Vec<Box<dyn ProblemResource>>,
}

impl Submission {
    pub fn new(problem: impl Problem) -> Self {
        Self {
            problem: Box::new(problem),
            storage: None,
            resources: Vec::new(),
        }
    }

    /// Shared storage handed to every worker computing this problem.
    pub fn with_storage(mut self, storage: Arc<dyn SharedStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// A resource released once no worker references the problem any more.
    pub fn with_resource(mut self, resource: impl ProblemResource + 'static) -> Self {
        self.resources.push(Box::new(resource));
        self
    }
}

/// A running master.
///
/// ```ignore
/// let master = Master::start(MasterConfig::from_env()?)?;
/// master.register_worker(worker).await?;
/// let id = master.submit_problem(client, Submission::new(problem))?;
/// ```
pub struct Master {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Master {
    /// Validate the configuration and start the background tasks. Must be
    /// called from within a tokio runtime.
    pub fn start(config: MasterConfig) -> Result<Self, FarmhandError> {
        config.validate()?;
        config.log_summary();

        let stats_port = config.stats.http_port;
        let dispatcher = Dispatcher::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(dispatcher.spawn_collector(shutdown_rx.clone()));

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        tasks.push(dispatcher.liveness().clone().spawn(lost_tx, shutdown_rx.clone()));
        let reaper = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(id) = lost_rx.recv().await {
                reaper.remove_worker(id, Departure::Unreachable);
            }
        }));

        if let Some(port) = stats_port {
            tasks.push(http::spawn_stats_server(port, dispatcher.clone(), shutdown_rx));
        }

        info!("master started");
        Ok(Self {
            dispatcher,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            drivers: Mutex::new(Vec::new()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn register_worker(&self, handle: Arc<dyn WorkerHandle>) -> Result<WorkerId, FarmhandError> {
        self.dispatcher.register_worker(handle).await
    }

    pub fn unregister_worker(&self, id: WorkerId) -> Result<(), FarmhandError> {
        self.dispatcher.unregister_worker(id)
    }

    pub async fn return_solution(
        &self,
        worker: WorkerId,
        key: AssignmentKey,
        solution: PartialSolution,
    ) -> Result<(), FarmhandError> {
        self.dispatcher.return_solution(worker, key, solution).await
    }

    pub async fn report_failure(
        &self,
        worker: WorkerId,
        key: AssignmentKey,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), FarmhandError> {
        self.dispatcher.report_failure(worker, key, kind, message.into()).await
    }

    /// Accept a problem and start its driver.
    pub fn submit_problem(
        &self,
        client: Arc<dyn ClientHandle>,
        submission: Submission,
    ) -> Result<ProblemId, FarmhandError> {
        let Submission { problem, storage, resources } = submission;
        let ctx = self.dispatcher.accept_problem(client, storage, resources)?;
        let id = ctx.id();
        let driver = Driver::new(self.dispatcher.clone(), ctx, problem);

        let mut drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        drivers.retain(|h| !h.is_finished());
        drivers.push(tokio::spawn(driver.run()));
        Ok(id)
    }

    pub fn abort_problem(&self, id: ProblemId) -> bool {
        self.dispatcher.abort_problem(id, ErrorKind::UserAbort, "aborted by client")
    }

    /// Abort the problem of a client that went away.
    pub fn abort_client(&self, client: ClientId) -> bool {
        self.dispatcher.abort_client(client)
    }

    pub fn problem_statistics(&self, id: ProblemId) -> Option<ProblemStatistics> {
        self.dispatcher.problem_statistics(id)
    }

    pub fn system_statistics(&self) -> SystemStatistics {
        self.dispatcher.system_statistics()
    }

    /// Abort every problem, send the workers away and stop background tasks.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.dispatcher.shutdown().await;

        let grace = self.dispatcher.config().shutdown.release_timeout() + Duration::from_secs(1);
        let drivers: Vec<_> = {
            let mut guard = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in drivers {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("driver did not stop in time");
            }
        }

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in tasks {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        info!("master stopped");
    }
}
