//! farmhand-demo: runs a master with in-process workers on a toy problem.
//!
//! Sums the squares of `1..=N` by splitting the range into chunks, one
//! partial problem per chunk.
//!
//! # Usage
//!
//! ```bash
//! farmhand-demo --workers 4 --numbers 100000 --chunk 5000 --work-ms 20
//!
//! # With a config file and the stats endpoint
//! FARMHAND_STATS_HTTP_PORT=9300 farmhand-demo --config farmhand.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use farmhand_core::{
    load_dotenv, ClientNotice, MasterConfig, PartialProblem, PartialSolution, Problem, Solution,
};
use farmhand_master::local::{ChannelClient, LocalWorker};
use farmhand_master::{Master, Submission};

/// Distributed sum of squares on a local farmhand master.
#[derive(Parser, Debug)]
#[command(name = "farmhand-demo", version, about)]
struct Cli {
    /// TOML config file; defaults plus `FARMHAND_*` overrides when absent.
    #[arg(long, env = "FARMHAND_CONFIG")]
    config: Option<PathBuf>,

    /// Number of in-process workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Sum the squares of 1..=N.
    #[arg(long, default_value_t = 100_000)]
    numbers: u64,

    /// Numbers per partial problem.
    #[arg(long, default_value_t = 5_000)]
    chunk: u64,

    /// Simulated compute time per partial problem, in milliseconds.
    #[arg(long, default_value_t = 20)]
    work_ms: u64,
}

/// Splits `1..=limit` into chunks and adds up the partial sums.
struct SumOfSquares {
    limit: u64,
    chunk: u64,
    next_start: u64,
    pending: u64,
    total: u64,
}

impl SumOfSquares {
    fn new(limit: u64, chunk: u64) -> Self {
        Self { limit, chunk: chunk.max(1), next_start: 1, pending: 0, total: 0 }
    }
}

impl Problem for SumOfSquares {
    fn next_partial_problem(&mut self, _hint: usize) -> anyhow::Result<Option<PartialProblem>> {
        if self.next_start > self.limit {
            return Ok(None);
        }
        let end = (self.next_start + self.chunk - 1).min(self.limit);
        let partial = PartialProblem::encode(&(self.next_start, end))?;
        self.next_start = end + 1;
        self.pending += 1;
        Ok(Some(partial))
    }

    fn collect_partial_solution(
        &mut self,
        _problem: &PartialProblem,
        solution: PartialSolution,
    ) -> anyhow::Result<()> {
        let sum: u64 = solution.decode()?;
        self.total = self.total.checked_add(sum).context("sum of squares overflows u64")?;
        self.pending -= 1;
        Ok(())
    }

    fn solution(&mut self) -> anyhow::Result<Option<Solution>> {
        if self.next_start > self.limit && self.pending == 0 {
            Ok(Some(Solution::encode(&self.total)?))
        } else {
            Ok(None)
        }
    }
}

fn sum_range(partial: &PartialProblem) -> anyhow::Result<PartialSolution> {
    let (start, end): (u64, u64) = partial.decode()?;
    let sum = (start..=end)
        .try_fold(0u64, |acc, n| n.checked_mul(n).and_then(|sq| acc.checked_add(sq)))
        .with_context(|| format!("sum of squares over {start}..={end} overflows u64"))?;
    Ok(PartialSolution::encode(&sum)?)
}

fn load_config(cli: &Cli) -> anyhow::Result<MasterConfig> {
    match &cli.config {
        Some(path) => {
            let mut config = MasterConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Ok(MasterConfig::from_env()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting farmhand-demo");

    let config = load_config(&cli)?;
    let master = Master::start(config)?;

    let delay = Duration::from_millis(cli.work_ms);
    for _ in 0..cli.workers.max(1) {
        let worker = Arc::new(LocalWorker::new(master.dispatcher(), sum_range).with_delay(delay));
        master.register_worker(worker).await?;
    }

    let (client, mut notices) = ChannelClient::new();
    let problem = master.submit_problem(client, Submission::new(SumOfSquares::new(cli.numbers, cli.chunk)))?;
    tracing::info!(%problem, numbers = cli.numbers, chunk = cli.chunk, "problem submitted");

    let outcome = loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(ClientNotice::Info(info)) => tracing::info!(?info, "master notice"),
                Some(other) => break Some(other),
                None => break None,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, aborting problem");
                master.abort_problem(problem);
            }
        }
    };

    match outcome {
        Some(ClientNotice::Solved { solution, statistics, .. }) => {
            let total: u64 = solution.decode()?;
            tracing::info!(
                total,
                partial_problems = statistics.generated,
                speculative = statistics.speculative_dispatches,
                duplicates = statistics.duplicates_discarded,
                mean_partial_ms = statistics.mean_partial_ms,
                age_ms = statistics.age_ms,
                "problem solved"
            );
            println!("{total}");
        }
        Some(ClientNotice::Failed { kind, message, .. }) => {
            tracing::error!(%kind, %message, "problem failed");
        }
        Some(ClientNotice::Aborted { .. }) => tracing::warn!("problem aborted"),
        Some(ClientNotice::Info(_)) | None => tracing::warn!("client channel closed"),
    }

    let stats = master.system_statistics();
    tracing::info!(
        dispatches = stats.dispatches,
        retries = stats.delivery_retries,
        workers_lost = stats.workers_lost,
        "master statistics"
    );

    master.shutdown().await;
    tracing::info!("farmhand-demo exited cleanly");
    Ok(())
}
