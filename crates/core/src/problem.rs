use crate::payload::{PartialProblem, PartialSolution, Solution};

/// Client-supplied unit of work.
///
/// A problem is owned by exactly one driver for its whole lifetime, so its
/// methods take `&mut self` and are never called concurrently. Errors are
/// arbitrary client errors; the master maps them onto
/// [`ErrorKind`](crate::ErrorKind) and aborts the problem.
pub trait Problem: Send + 'static {
    /// Produce the next partial problem, or `None` if nothing can be produced
    /// right now. `hint` suggests how many workers this problem may keep busy.
    fn next_partial_problem(&mut self, hint: usize) -> anyhow::Result<Option<PartialProblem>>;

    /// Fold the result of one partial problem back in.
    fn collect_partial_solution(
        &mut self,
        problem: &PartialProblem,
        solution: PartialSolution,
    ) -> anyhow::Result<()>;

    /// The final solution, once enough partial solutions have been folded.
    fn solution(&mut self) -> anyhow::Result<Option<Solution>>;
}
