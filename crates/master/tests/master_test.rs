use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use farmhand_core::{
    ClientNotice, ErrorKind, FarmhandError, MasterConfig, PartialProblem, PartialSolution, Problem,
    ProblemResource, Solution, SubmitError,
};
use farmhand_master::local::{ChannelClient, LocalWorker};
use farmhand_master::{Master, Submission};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.dispatch.retry_backoff_ms = 1;
    config.liveness.interval_ms = 50;
    config.liveness.probe_timeout_ms = 20;
    config.client.retry_backoff_ms = 1;
    config.shutdown.release_timeout_ms = 500;
    config
}

fn square(partial: &PartialProblem) -> anyhow::Result<PartialSolution> {
    let n: u64 = partial.decode()?;
    Ok(PartialSolution::encode(&(n * n))?)
}

/// Generates `1..=count` and sums the returned squares.
struct SquareSum {
    count: u64,
    next: u64,
    folded: u64,
    sum: u64,
    /// Highest number of generated-but-unfolded partial problems seen.
    peak_outstanding: Arc<AtomicUsize>,
}

impl SquareSum {
    fn new(count: u64) -> Self {
        Self { count, next: 1, folded: 0, sum: 0, peak_outstanding: Arc::new(AtomicUsize::new(0)) }
    }

    fn expected(count: u64) -> u64 {
        (1..=count).map(|n| n * n).sum()
    }
}

impl Problem for SquareSum {
    fn next_partial_problem(&mut self, _hint: usize) -> anyhow::Result<Option<PartialProblem>> {
        if self.next > self.count {
            return Ok(None);
        }
        let partial = PartialProblem::encode(&self.next)?;
        self.next += 1;
        let outstanding = (self.next - 1 - self.folded) as usize;
        self.peak_outstanding.fetch_max(outstanding, Ordering::SeqCst);
        Ok(Some(partial))
    }

    fn collect_partial_solution(&mut self, _problem: &PartialProblem, solution: PartialSolution) -> anyhow::Result<()> {
        self.sum += solution.decode::<u64>()?;
        self.folded += 1;
        Ok(())
    }

    fn solution(&mut self) -> anyhow::Result<Option<Solution>> {
        if self.folded == self.count {
            Ok(Some(Solution::encode(&self.sum)?))
        } else {
            Ok(None)
        }
    }
}

/// Wraps a problem and injects a failure at one step.
enum Fault {
    GenerateOnCall(usize),
    Collect,
    Solution,
}

struct Faulty {
    inner: SquareSum,
    fault: Fault,
    calls: usize,
}

impl Problem for Faulty {
    fn next_partial_problem(&mut self, hint: usize) -> anyhow::Result<Option<PartialProblem>> {
        self.calls += 1;
        if let Fault::GenerateOnCall(n) = self.fault {
            if self.calls == n {
                anyhow::bail!("generator broke on call {n}");
            }
        }
        self.inner.next_partial_problem(hint)
    }

    fn collect_partial_solution(&mut self, problem: &PartialProblem, solution: PartialSolution) -> anyhow::Result<()> {
        if let Fault::Collect = self.fault {
            anyhow::bail!("cannot fold");
        }
        self.inner.collect_partial_solution(problem, solution)
    }

    fn solution(&mut self) -> anyhow::Result<Option<Solution>> {
        if let Fault::Solution = self.fault {
            if self.inner.folded > 0 {
                anyhow::bail!("cannot assemble solution");
            }
        }
        self.inner.solution()
    }
}

/// Produces neither work nor a solution.
struct Barren;

impl Problem for Barren {
    fn next_partial_problem(&mut self, _hint: usize) -> anyhow::Result<Option<PartialProblem>> {
        Ok(None)
    }

    fn collect_partial_solution(&mut self, _problem: &PartialProblem, _solution: PartialSolution) -> anyhow::Result<()> {
        Ok(())
    }

    fn solution(&mut self) -> anyhow::Result<Option<Solution>> {
        Ok(None)
    }
}

struct ReleaseFlag(Arc<AtomicBool>);

impl ProblemResource for ReleaseFlag {
    fn name(&self) -> &str {
        "release-flag"
    }

    fn release(&self) -> anyhow::Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn add_workers(master: &Master, count: usize, delay: Duration) -> Vec<Arc<LocalWorker>> {
    let mut workers = Vec::new();
    for _ in 0..count {
        let worker = Arc::new(LocalWorker::new(master.dispatcher(), square).with_delay(delay));
        master.register_worker(worker.clone()).await.unwrap();
        workers.push(worker);
    }
    workers
}

/// The first notice that is not informational.
async fn outcome(rx: &mut UnboundedReceiver<ClientNotice>) -> ClientNotice {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(ClientNotice::Info(_)) => continue,
                Some(notice) => return notice,
                None => panic!("client channel closed"),
            }
        }
    })
    .await
    .expect("problem should finish")
}

fn expect_solved(notice: ClientNotice) -> (u64, farmhand_core::ProblemStatistics) {
    match notice {
        ClientNotice::Solved { solution, statistics, .. } => (solution.decode().unwrap(), statistics),
        other => panic!("expected a solution, got {other:?}"),
    }
}

fn expect_failed(notice: ClientNotice) -> ErrorKind {
    match notice {
        ClientNotice::Failed { kind, .. } => kind,
        other => panic!("expected a failure, got {other:?}"),
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn single_worker_solves_three_partial_problems() {
    let mut cfg = config();
    cfg.dispatch.speculative = false;
    let master = Master::start(cfg).unwrap();
    let workers = add_workers(&master, 1, Duration::ZERO).await;

    let (client, mut rx) = ChannelClient::new();
    let id = master.submit_problem(client, Submission::new(SquareSum::new(3))).unwrap();

    let (sum, stats) = expect_solved(outcome(&mut rx).await);
    assert_eq!(sum, 14);
    assert_eq!(stats.generated, 3);
    assert_eq!(stats.solved, 3);
    assert_eq!(stats.aborted, 0);
    assert_eq!(workers[0].completed(), 3);
    assert_eq!(master.system_statistics().dispatches, 3);
    assert_eq!(master.system_statistics().problems_solved, 1);
    assert!(master.problem_statistics(id).is_none(), "solved problem leaves the table");

    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_problems_all_solve() {
    let master = Master::start(config()).unwrap();
    add_workers(&master, 4, Duration::from_millis(2)).await;

    let mut receivers = Vec::new();
    for count in [20, 35, 50] {
        let (client, rx) = ChannelClient::new();
        master.submit_problem(client, Submission::new(SquareSum::new(count))).unwrap();
        receivers.push((count, rx));
    }

    for (count, mut rx) in receivers {
        let (sum, stats) = expect_solved(outcome(&mut rx).await);
        assert_eq!(sum, SquareSum::expected(count));
        assert_eq!(stats.generated, count);
    }
    let system = master.system_statistics();
    assert_eq!(system.problems_solved, 3);
    assert_eq!(system.running_problems, 0);

    master.shutdown().await;
}

#[tokio::test]
async fn outstanding_work_stays_within_limit() {
    let mut cfg = config();
    cfg.throttle.slack = 1;
    let master = Master::start(cfg).unwrap();
    add_workers(&master, 2, Duration::from_millis(5)).await;

    let problem = SquareSum::new(40);
    let peak = problem.peak_outstanding.clone();
    let (client, mut rx) = ChannelClient::new();
    master.submit_problem(client, Submission::new(problem)).unwrap();

    let (sum, _) = expect_solved(outcome(&mut rx).await);
    assert_eq!(sum, SquareSum::expected(40));
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak outstanding {peak} exceeds workers + slack");
    assert!(peak >= 2, "generation should run ahead of the workers");

    master.shutdown().await;
}

#[tokio::test]
async fn generator_failure_is_reported_once() {
    let master = Master::start(config()).unwrap();
    add_workers(&master, 1, Duration::from_millis(5)).await;

    let (client, mut rx) = ChannelClient::new();
    let faulty = Faulty { inner: SquareSum::new(5), fault: Fault::GenerateOnCall(2), calls: 0 };
    master.submit_problem(client, Submission::new(faulty)).unwrap();

    assert_eq!(expect_failed(outcome(&mut rx).await), ErrorKind::PartialProblemCreateFailed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(extra) = rx.try_recv() {
        assert!(matches!(extra, ClientNotice::Info(_)), "unexpected second notice: {extra:?}");
    }
    assert_eq!(master.system_statistics().problems_aborted, 1);

    master.shutdown().await;
}

#[tokio::test]
async fn client_code_failures_map_to_error_kinds() {
    let master = Master::start(config()).unwrap();
    add_workers(&master, 2, Duration::ZERO).await;

    let cases = [
        (Fault::Collect, ErrorKind::PartialSolutionCollectFailed),
        (Fault::Solution, ErrorKind::SolutionCreateFailed),
    ];
    for (fault, expected) in cases {
        let (client, mut rx) = ChannelClient::new();
        let faulty = Faulty { inner: SquareSum::new(4), fault, calls: 0 };
        master.submit_problem(client, Submission::new(faulty)).unwrap();
        assert_eq!(expect_failed(outcome(&mut rx).await), expected);
    }

    master.shutdown().await;
}

#[tokio::test]
async fn problem_without_work_or_solution_is_incorrect() {
    let master = Master::start(config()).unwrap();
    add_workers(&master, 1, Duration::ZERO).await;

    let (client, mut rx) = ChannelClient::new();
    master.submit_problem(client, Submission::new(Barren)).unwrap();
    assert_eq!(expect_failed(outcome(&mut rx).await), ErrorKind::IncorrectProblem);

    master.shutdown().await;
}

#[tokio::test]
async fn compute_failure_aborts_problem() {
    let master = Master::start(config()).unwrap();
    let worker = LocalWorker::new(master.dispatcher(), |partial: &PartialProblem| {
        let n: u64 = partial.decode()?;
        anyhow::ensure!(n != 3, "three is unlucky");
        Ok(PartialSolution::encode(&(n * n))?)
    });
    master.register_worker(Arc::new(worker)).await.unwrap();

    let (client, mut rx) = ChannelClient::new();
    master.submit_problem(client, Submission::new(SquareSum::new(5))).unwrap();
    match outcome(&mut rx).await {
        ClientNotice::Failed { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::PartialProblemComputeFailed);
            assert!(message.contains("unlucky"));
        }
        other => panic!("expected a failure, got {other:?}"),
    }

    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_worker_does_not_lose_or_duplicate_work() {
    let master = Master::start(config()).unwrap();
    let workers = add_workers(&master, 2, Duration::from_millis(40)).await;

    let (client, mut rx) = ChannelClient::new();
    master.submit_problem(client, Submission::new(SquareSum::new(12))).unwrap();

    eventually("first worker busy", || workers[0].accepted() > 0).await;
    workers[0].set_reachable(false);

    let (sum, stats) = expect_solved(outcome(&mut rx).await);
    assert_eq!(sum, SquareSum::expected(12), "each partial solution folded exactly once");
    assert_eq!(stats.generated, 12);
    eventually("lost worker removed", || master.system_statistics().workers_lost == 1).await;
    assert_eq!(master.system_statistics().registered_workers, 1);

    master.shutdown().await;
}

#[tokio::test]
async fn client_abort_releases_resources() {
    let master = Master::start(config()).unwrap();
    let workers = add_workers(&master, 2, Duration::from_millis(200)).await;

    let released = Arc::new(AtomicBool::new(false));
    let (client, mut rx) = ChannelClient::new();
    let submission = Submission::new(SquareSum::new(100)).with_resource(ReleaseFlag(released.clone()));
    let id = master.submit_problem(client, submission).unwrap();

    eventually("work in flight", || workers.iter().any(|w| w.current().is_some())).await;
    assert!(master.abort_problem(id));
    assert!(!master.abort_problem(id), "second abort is a no-op");

    assert_eq!(outcome(&mut rx).await, ClientNotice::Aborted { problem: id });
    eventually("resources released", || released.load(Ordering::SeqCst)).await;
    eventually("workers stopped", || workers.iter().all(|w| w.current().is_none())).await;

    master.shutdown().await;
}

#[tokio::test]
async fn submission_needs_a_worker_and_a_free_client() {
    let master = Master::start(config()).unwrap();
    let (client, _rx) = ChannelClient::new();
    let refused = master.submit_problem(client.clone(), Submission::new(SquareSum::new(1)));
    assert!(matches!(refused, Err(FarmhandError::Submit(SubmitError::NoWorkers))));

    add_workers(&master, 1, Duration::from_millis(200)).await;
    master.submit_problem(client.clone(), Submission::new(SquareSum::new(50))).unwrap();
    let busy = master.submit_problem(client, Submission::new(SquareSum::new(1)));
    assert!(matches!(busy, Err(FarmhandError::Submit(SubmitError::ClientBusy(_)))));

    master.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_running_problems() {
    let master = Master::start(config()).unwrap();
    add_workers(&master, 1, Duration::from_millis(200)).await;

    let (client, mut rx) = ChannelClient::new();
    master.submit_problem(client, Submission::new(SquareSum::new(50))).unwrap();
    master.shutdown().await;

    assert_eq!(expect_failed(outcome(&mut rx).await), ErrorKind::DispatcherShutdown);
    assert_eq!(master.system_statistics().registered_workers, 0);
}
