//! Governance error taxonomy
//!
//! Validation and state-conflict errors are reported synchronously to the
//! caller. Storage and treasury errors raised while dispatching are retried
//! by the execution queue and end up as text on the task record.

use thiserror::Error;

/// Errors raised by the governance engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernanceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Reviewer {0} has already reviewed this item")]
    DuplicateReview(String),

    #[error("Insufficient treasury balance: need {need}, have {have}")]
    InsufficientTreasury { need: u64, have: u64 },

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GovernanceError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a failed dispatch with this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::InsufficientTreasury { .. })
    }
}

impl From<rusqlite::Error> for GovernanceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GovernanceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {}", err))
    }
}

pub type GovernanceResult<T> = Result<T, GovernanceError>;
