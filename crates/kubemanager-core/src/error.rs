//! Validation errors raised while parsing user-supplied values.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid quantity {input:?}: {reason}")]
    InvalidQuantity { input: String, reason: String },

    #[error("invalid image reference {0:?}")]
    InvalidImage(String),

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
}

impl CoreError {
    pub(crate) fn quantity(input: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidQuantity {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
