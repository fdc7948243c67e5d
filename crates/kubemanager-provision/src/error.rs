//! Error types for provisioning operations.

use kubemanager_cluster::ClusterError;
use kubemanager_core::CoreError;
use kubemanager_saga::{SagaError, StepError};
use kubemanager_state::StateError;
use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("quota exceeded for {resource}: requested total {requested} exceeds limit {limit}")]
    QuotaExceeded {
        resource: String,
        requested: String,
        limit: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("saga error: {0}")]
    Saga(SagaError),

    #[error("cluster error: {0}")]
    Cluster(ClusterError),

    #[error("saga task aborted: {0}")]
    Task(String),
}

impl From<CoreError> for ProvisionError {
    fn from(err: CoreError) -> Self {
        ProvisionError::Validation(err.to_string())
    }
}

impl From<StateError> for ProvisionError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => ProvisionError::NotFound(what),
            StateError::Conflict(what) => ProvisionError::Conflict(what),
            other => ProvisionError::State(other),
        }
    }
}

impl From<SagaError> for ProvisionError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::NotFound(id) => ProvisionError::NotFound(format!("saga {id}")),
            SagaError::AlreadyFinished(id) => {
                ProvisionError::Conflict(format!("saga {id} already finished"))
            }
            other => ProvisionError::Saga(other),
        }
    }
}

impl From<ClusterError> for ProvisionError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(what) => ProvisionError::NotFound(what),
            other => ProvisionError::Cluster(other),
        }
    }
}

/// Classify a cluster failure for the saga retry decision.
pub(crate) fn step_error(err: ClusterError) -> StepError {
    if err.is_transient() {
        return StepError::Transient(err.to_string());
    }
    match err {
        ClusterError::NotFound(what) => StepError::NotFound(what),
        ClusterError::Invalid(what) | ClusterError::AlreadyExists(what) => {
            StepError::Validation(what)
        }
        other => StepError::Validation(other.to_string()),
    }
}

impl From<ProvisionError> for StepError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::NotFound(what) => StepError::NotFound(what),
            ProvisionError::Cluster(inner) => step_error(inner),
            ProvisionError::State(inner) => StepError::from(inner),
            ProvisionError::Saga(inner) => StepError::Transient(inner.to_string()),
            other => StepError::Validation(other.to_string()),
        }
    }
}
