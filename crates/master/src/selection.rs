//! Choosing which problem's fresh work goes to the shared queue next.
//!
//! Problems closest to completion go first: the estimated remaining time is
//! the mean partial-problem duration times the number of outstanding partial
//! problems. A problem nobody is computing for estimates at zero, and ties are
//! broken in favour of the problem that received the least compute time
//! relative to its age.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ProblemContext;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Urgency {
    pub estimated_remaining: Duration,
    pub computation_ratio: f64,
}

impl Urgency {
    pub fn of(ctx: &ProblemContext) -> Self {
        let stats = ctx.stats();
        let estimated_remaining = if stats.computing_workers() == 0 {
            Duration::ZERO
        } else {
            let outstanding = ctx.ledger().outstanding_count() as u32;
            stats.mean_partial_duration().saturating_mul(outstanding)
        };
        Self {
            estimated_remaining,
            computation_ratio: stats.computation_ratio(),
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        self.estimated_remaining
            .cmp(&other.estimated_remaining)
            .then_with(|| self.computation_ratio.total_cmp(&other.computation_ratio))
    }
}

/// The most urgent candidate. Earlier candidates win exact ties.
pub fn pick<T>(candidates: impl IntoIterator<Item = (T, Urgency)>) -> Option<T> {
    let mut best: Option<(T, Urgency)> = None;
    for (item, urgency) in candidates {
        let better = match &best {
            None => true,
            Some((_, current)) => urgency.cmp(current) == Ordering::Less,
        };
        if better {
            best = Some((item, urgency));
        }
    }
    best.map(|(item, _)| item)
}

/// Pick the problem whose fresh work should be queued next. Terminated
/// problems and problems without fresh work are skipped.
pub fn select_next(problems: &[Arc<ProblemContext>]) -> Option<Arc<ProblemContext>> {
    pick(
        problems
            .iter()
            .filter(|ctx| !ctx.is_terminated() && ctx.ledger().has_fresh())
            .map(|ctx| (ctx.clone(), Urgency::of(ctx))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::ledger::PartialProblemRecord;
    use farmhand_core::{PartialProblem, PartialProblemId};

    fn urgency(ms: u64, ratio: f64) -> Urgency {
        Urgency {
            estimated_remaining: Duration::from_millis(ms),
            computation_ratio: ratio,
        }
    }

    #[test]
    fn lowest_remaining_time_wins() {
        let got = pick([("a", urgency(300, 0.1)), ("b", urgency(100, 0.9)), ("c", urgency(200, 0.0))]);
        assert_eq!(got, Some("b"));
    }

    #[test]
    fn ties_go_to_least_served_problem() {
        let got = pick([("busy", urgency(0, 0.8)), ("starved", urgency(0, 0.05)), ("mid", urgency(0, 0.3))]);
        assert_eq!(got, Some("starved"));
    }

    #[test]
    fn exact_tie_keeps_first_candidate() {
        assert_eq!(pick([(1, urgency(0, 0.0)), (2, urgency(0, 0.0))]), Some(1));
    }

    #[test]
    fn empty_candidates_pick_nothing() {
        assert_eq!(pick(Vec::<(u8, Urgency)>::new()), None);
    }

    #[tokio::test]
    async fn select_next_skips_problems_without_fresh_work() {
        let idle = test_context();
        let ready = test_context();
        let ended = test_context();
        for ctx in [&ready, &ended] {
            let record = PartialProblemRecord::new(
                PartialProblemId(1),
                ctx,
                PartialProblem::encode(&1u8).unwrap(),
            );
            ctx.ledger().admit(Arc::new(record)).await;
        }
        ended.terminate();

        let chosen = select_next(&[idle, ready.clone(), ended]).unwrap();
        assert_eq!(chosen.id(), ready.id());
    }

    #[tokio::test]
    async fn select_next_favours_least_served_idle_problem() {
        let served = test_context();
        let starved = test_context();
        for (n, ctx) in [&served, &starved].into_iter().enumerate() {
            let record = PartialProblemRecord::new(
                PartialProblemId(n as u64 + 1),
                ctx,
                PartialProblem::encode(&1u8).unwrap(),
            );
            ctx.ledger().admit(Arc::new(record)).await;
        }
        served.stats().record_solved(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (a, b) = (Urgency::of(&served), Urgency::of(&starved));
        assert_eq!(a.estimated_remaining, b.estimated_remaining);
        assert!(a.computation_ratio > b.computation_ratio);

        let chosen = select_next(&[served, starved.clone()]).unwrap();
        assert_eq!(chosen.id(), starved.id());
    }

    #[test]
    fn idle_problem_estimates_zero() {
        let ctx = test_context();
        ctx.stats().record_solved(Duration::from_millis(50));
        assert_eq!(Urgency::of(&ctx).estimated_remaining, Duration::ZERO);
    }
}
