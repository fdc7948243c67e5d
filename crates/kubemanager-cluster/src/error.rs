//! Error types for cluster access.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object changed between read and write (stale resourceVersion).
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("kubernetes api error: {0}")]
    Api(String),

    #[error("helm error: {0}")]
    Helm(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("cluster client configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Api(_) | ClusterError::Helm(_) | ClusterError::Conflict(_)
        )
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(resp.message)
            }
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message),
            kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => {
                ClusterError::Invalid(resp.message)
            }
            other => ClusterError::Api(other.to_string()),
        }
    }
}

impl ClusterError {
    /// For read-then-write upserts: losing a create race is a conflict the
    /// next attempt resolves by re-reading.
    pub(crate) fn upsert(err: kube::Error) -> Self {
        match ClusterError::from(err) {
            ClusterError::AlreadyExists(what) => ClusterError::Conflict(what),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} from server"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn stale_resource_version_is_retryable() {
        let err = ClusterError::from(api_error(409, "Conflict"));
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn already_exists_is_kept_apart() {
        let err = ClusterError::from(api_error(409, "AlreadyExists"));
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
        assert!(!err.is_transient());

        let err = ClusterError::upsert(api_error(409, "AlreadyExists"));
        assert!(err.is_transient());
    }

    #[test]
    fn status_codes_classify() {
        assert!(matches!(
            ClusterError::from(api_error(404, "NotFound")),
            ClusterError::NotFound(_)
        ));
        assert!(matches!(
            ClusterError::from(api_error(422, "Invalid")),
            ClusterError::Invalid(_)
        ));
        assert!(ClusterError::from(api_error(500, "InternalError")).is_transient());
    }
}
