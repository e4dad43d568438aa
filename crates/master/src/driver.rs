//! Per-problem driver: generates partial problems within the outstanding
//! limit, folds returned solutions in, and decides when the problem is done.
//!
//! The user's [`Problem`] is only ever touched from the driver's task.

use std::sync::Arc;

use tracing::{debug, info};

use farmhand_core::{ErrorKind, PartialSolution, Problem};

use crate::context::ProblemContext;
use crate::dispatcher::Dispatcher;
use crate::ledger::PartialProblemRecord;

/// What the driver loop does next.
enum Step {
    Continue,
    Stop,
}

pub struct Driver {
    dispatcher: Arc<Dispatcher>,
    ctx: Arc<ProblemContext>,
    problem: Box<dyn Problem>,
    /// Generated and not yet folded.
    outstanding: usize,
    /// The generator returned nothing; retried after the next fold.
    exhausted: bool,
}

impl Driver {
    pub fn new(dispatcher: Arc<Dispatcher>, ctx: Arc<ProblemContext>, problem: Box<dyn Problem>) -> Self {
        Self {
            dispatcher,
            ctx,
            problem,
            outstanding: 0,
            exhausted: false,
        }
    }

    /// Drive the problem to completion or abort, then tear it down.
    pub async fn run(mut self) {
        let id = self.ctx.id();
        info!(problem = %id, "driver started");
        self.drive().await;
        self.dispatcher.retire_problem(&self.ctx).await;
        info!(problem = %id, "driver stopped");
    }

    async fn drive(&mut self) {
        let ctx = self.ctx.clone();
        loop {
            if ctx.is_terminated() {
                return;
            }
            while let Some((record, solution)) = ctx.solutions().try_take() {
                if let Step::Stop = self.fold(&record, solution).await {
                    return;
                }
            }

            if !self.exhausted && self.outstanding < self.dispatcher.outstanding_limit() {
                match self.generate().await {
                    Step::Continue => continue,
                    Step::Stop => return,
                }
            }

            let wake = ctx.wake_signal().notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            if ctx.is_terminated() {
                return;
            }
            tokio::select! {
                (record, solution) = ctx.solutions().take() => {
                    if let Step::Stop = self.fold(&record, solution).await {
                        return;
                    }
                }
                _ = &mut wake => {}
            }
        }
    }

    async fn generate(&mut self) -> Step {
        let hint = self.dispatcher.batch_hint();
        match self.problem.next_partial_problem(hint) {
            Err(e) => self.fail(ErrorKind::PartialProblemCreateFailed, e),
            Ok(Some(partial)) => {
                let record = Arc::new(PartialProblemRecord::new(
                    self.dispatcher.next_partial_id(),
                    &self.ctx,
                    partial,
                ));
                self.outstanding += 1;
                self.ctx.stats().record_generated();
                debug!(partial = %record.key(), outstanding = self.outstanding, "partial problem generated");
                if self.ctx.ledger().admit(record).await {
                    self.dispatcher.signal_work();
                }
                Step::Continue
            }
            Ok(None) => match self.check_solution().await {
                Step::Stop => Step::Stop,
                Step::Continue if self.outstanding == 0 => self.fail(
                    ErrorKind::IncorrectProblem,
                    anyhow::anyhow!("problem produced neither work nor a solution"),
                ),
                Step::Continue => {
                    self.exhausted = true;
                    Step::Continue
                }
            },
        }
    }

    async fn fold(&mut self, record: &PartialProblemRecord, solution: PartialSolution) -> Step {
        if let Err(e) = self.problem.collect_partial_solution(record.partial_problem(), solution) {
            return self.fail(ErrorKind::PartialSolutionCollectFailed, e);
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        self.exhausted = false;
        debug!(partial = %record.key(), outstanding = self.outstanding, "partial solution folded");
        self.check_solution().await
    }

    /// Ask the problem for its final solution; stop if there is one.
    async fn check_solution(&mut self) -> Step {
        match self.problem.solution() {
            Err(e) => self.fail(ErrorKind::SolutionCreateFailed, e),
            Ok(Some(solution)) => {
                self.dispatcher.finish_problem(&self.ctx, solution).await;
                Step::Stop
            }
            Ok(None) => Step::Continue,
        }
    }

    fn fail(&self, kind: ErrorKind, error: anyhow::Error) -> Step {
        self.dispatcher.abort_problem(self.ctx.id(), kind, format!("{error:#}"));
        Step::Stop
    }
}
