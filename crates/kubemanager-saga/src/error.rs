//! Error types for the saga engine.

use std::time::Duration;

use kubemanager_state::StateError;
use thiserror::Error;

/// Result of a single step attempt.
pub type StepResult<T = ()> = Result<T, StepError>;

/// Failure of one step attempt, classified for the retry decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// Malformed input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A required entity (role, project, workload) is missing. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cluster API, Helm or database hiccup. Retried per policy.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// The attempt exceeded its step timeout. Retried per policy.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// A cancel signal was observed.
    #[error("saga cancelled")]
    Cancelled,
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_) | StepError::Timeout(_))
    }
}

impl From<StateError> for StepError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => StepError::NotFound(what),
            StateError::Conflict(what) => StepError::Validation(what),
            other => StepError::Transient(other.to_string()),
        }
    }
}

/// Result type alias for engine operations.
pub type SagaResult<T> = Result<T, SagaError>;

/// Errors of the engine itself, as opposed to failures of the steps it runs.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("saga context (de)serialization failed: {0}")]
    Context(#[from] serde_json::Error),

    #[error("saga not found: {0}")]
    NotFound(String),

    #[error("saga {0} already finished")]
    AlreadyFinished(String),

    #[error("saga {saga_id} is a '{actual}' saga, not '{expected}'")]
    KindMismatch {
        saga_id: String,
        expected: String,
        actual: String,
    },
}
