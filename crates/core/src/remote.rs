//! Interfaces of the master's remote collaborators.
//!
//! The wire transport itself lives outside this workspace. These traits are
//! the calls the master makes on workers and clients; a transport adapter
//! implements them and forwards worker callbacks
//! (`return_solution`, `report_failure`) to the master.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TransportError};
use crate::ids::{AssignmentKey, ClientId, ProblemId, WorkerId};
use crate::payload::{PartialProblem, Payload, Solution};
use crate::stats::ProblemStatistics;

/// A partial problem on its way to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub key: AssignmentKey,
    pub partial_problem: PartialProblem,
}

/// Opaque description of a problem's shared storage, handed to workers so
/// they can attach to it before computing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub kind: String,
    pub config: Payload,
}

/// Calls the master makes on a registered worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Liveness probe.
    async fn is_reachable(&self) -> bool;

    /// Hand a partial problem to the worker. Returns once the worker has
    /// accepted it; the result arrives later through the master.
    async fn fetch_partial_problem(
        &self,
        assignment: Assignment,
        storage: Option<StorageDescriptor>,
    ) -> Result<(), TransportError>;

    /// Ask the worker to drop the computation of `key`. A worker that has
    /// moved on to another assignment ignores the request.
    async fn stop_computation(&self, key: AssignmentKey) -> Result<(), TransportError>;

    /// Tell the worker it is no longer registered.
    async fn deregister(&self) -> Result<(), TransportError>;

    /// Tell the worker to terminate immediately.
    async fn shutdown_now(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: WorkerHandle + ?Sized> WorkerHandle for Arc<T> {
    fn id(&self) -> WorkerId {
        (**self).id()
    }

    async fn is_reachable(&self) -> bool {
        (**self).is_reachable().await
    }

    async fn fetch_partial_problem(
        &self,
        assignment: Assignment,
        storage: Option<StorageDescriptor>,
    ) -> Result<(), TransportError> {
        (**self).fetch_partial_problem(assignment, storage).await
    }

    async fn stop_computation(&self, key: AssignmentKey) -> Result<(), TransportError> {
        (**self).stop_computation(key).await
    }

    async fn deregister(&self) -> Result<(), TransportError> {
        (**self).deregister().await
    }

    async fn shutdown_now(&self) -> Result<(), TransportError> {
        (**self).shutdown_now().await
    }
}

/// Broadcasts that concern every client but abort nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoNotice {
    NoWorkersRegistered,
    WorkersAvailableAgain,
}

/// Everything the master ever tells a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientNotice {
    Solved {
        problem: ProblemId,
        solution: Solution,
        statistics: ProblemStatistics,
    },
    Failed {
        problem: ProblemId,
        kind: ErrorKind,
        message: String,
    },
    /// Confirmation of a client-initiated abort.
    Aborted { problem: ProblemId },
    Info(InfoNotice),
}

impl ClientNotice {
    pub fn problem(&self) -> Option<ProblemId> {
        match self {
            ClientNotice::Solved { problem, .. }
            | ClientNotice::Failed { problem, .. }
            | ClientNotice::Aborted { problem } => Some(*problem),
            ClientNotice::Info(_) => None,
        }
    }
}

/// Asynchronous callback channel to a client.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    fn id(&self) -> ClientId;

    async fn notify(&self, notice: ClientNotice) -> Result<(), TransportError>;
}

/// Per-problem shared storage that communicating partial problems use.
pub trait SharedStorage: Send + Sync {
    fn descriptor(&self) -> StorageDescriptor;

    /// Tear the storage down. Called once, after no worker references the problem.
    fn release(&self) -> anyhow::Result<()>;
}

/// Any other per-problem handle that must outlive every worker referencing
/// the problem, such as a lease on the problem's code bundle.
pub trait ProblemResource: Send + Sync {
    fn name(&self) -> &str;

    fn release(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PartialProblemId;

    #[test]
    fn notice_reports_its_problem() {
        let problem = ProblemId::new();
        let failed = ClientNotice::Failed {
            problem,
            kind: ErrorKind::IncorrectProblem,
            message: "no work and no solution".into(),
        };
        assert_eq!(failed.problem(), Some(problem));
        assert_eq!(ClientNotice::Info(InfoNotice::NoWorkersRegistered).problem(), None);
    }

    #[test]
    fn assignment_survives_messagepack() {
        let assignment = Assignment {
            key: AssignmentKey {
                problem: ProblemId::new(),
                partial: PartialProblemId(9),
            },
            partial_problem: PartialProblem::encode(&(1u32, 2u32)).unwrap(),
        };
        let bytes = rmp_serde::to_vec(&assignment).unwrap();
        let back: Assignment = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, assignment);
    }
}
