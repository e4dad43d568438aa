use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a problem ended abnormally, or why a client was told something.
///
/// Every abort path carries exactly one of these to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The problem raised while generating a partial problem.
    PartialProblemCreateFailed,
    /// Folding a partial solution back into the problem raised.
    PartialSolutionCollectFailed,
    /// Asking the problem for its final solution raised.
    SolutionCreateFailed,
    /// Delivering a partial problem to a worker exhausted its retries.
    PartialProblemSendFailed,
    /// A worker could not deliver its partial solution.
    PartialSolutionSendFailed,
    /// Delivering the final solution to the client exhausted its retries.
    SolutionSendFailed,
    /// A worker reported an application error while computing.
    PartialProblemComputeFailed,
    /// The problem yielded neither further work nor a solution.
    IncorrectProblem,
    /// The client cancelled the problem.
    UserAbort,
    /// Informational: the last worker left.
    NoWorkersRegistered,
    /// Informational: a worker arrived after a period with none.
    WorkersAvailableAgain,
    /// The master is shutting down.
    DispatcherShutdown,
}

impl ErrorKind {
    /// Informational kinds are broadcast and never abort a problem.
    pub fn is_informational(self) -> bool {
        matches!(
            self,
            ErrorKind::NoWorkersRegistered | ErrorKind::WorkersAvailableAgain
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PartialProblemCreateFailed => "partial problem creation failed",
            ErrorKind::PartialSolutionCollectFailed => "partial solution collection failed",
            ErrorKind::SolutionCreateFailed => "solution creation failed",
            ErrorKind::PartialProblemSendFailed => "partial problem could not be sent",
            ErrorKind::PartialSolutionSendFailed => "partial solution could not be sent",
            ErrorKind::SolutionSendFailed => "solution could not be sent",
            ErrorKind::PartialProblemComputeFailed => "partial problem computation failed",
            ErrorKind::IncorrectProblem => "incorrect problem",
            ErrorKind::UserAbort => "aborted by user",
            ErrorKind::NoWorkersRegistered => "no workers registered",
            ErrorKind::WorkersAvailableAgain => "workers available again",
            ErrorKind::DispatcherShutdown => "dispatcher shut down",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the remote-call transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Communication failure: connection refused, timeout, broken pipe.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The worker is still computing something else.
    #[error("worker already busy")]
    AlreadyBusy,

    /// The worker could not attach the problem's shared storage.
    #[error("storage setup failed: {0}")]
    StorageSetupFailed(String),
}

impl TransportError {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

/// Reasons a submission is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("no workers registered")]
    NoWorkers,

    #[error("client {0} already has a running problem")]
    ClientBusy(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the master's public operations.
#[derive(Debug, Error)]
pub enum FarmhandError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("unknown problem: {0}")]
    UnknownProblem(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unreachable_is_retryable() {
        assert!(TransportError::Unreachable("timeout".into()).is_retryable());
        assert!(!TransportError::AlreadyBusy.is_retryable());
        assert!(!TransportError::StorageSetupFailed("disk".into()).is_retryable());
    }

    #[test]
    fn informational_kinds() {
        assert!(ErrorKind::NoWorkersRegistered.is_informational());
        assert!(ErrorKind::WorkersAvailableAgain.is_informational());
        assert!(!ErrorKind::UserAbort.is_informational());
        assert!(!ErrorKind::IncorrectProblem.is_informational());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PartialProblemCreateFailed).unwrap();
        assert_eq!(json, "\"partial_problem_create_failed\"");
    }

    #[test]
    fn submit_error_wraps_into_farmhand_error() {
        let err: FarmhandError = SubmitError::NoWorkers.into();
        assert_eq!(err.to_string(), "no workers registered");
    }
}
