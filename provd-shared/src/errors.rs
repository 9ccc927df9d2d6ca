//! Error types used across the provd provisioning pipeline.

use thiserror::Error;

/// Result type for provd operations.
pub type ProvdResult<T> = Result<T, ProvdError>;

#[derive(Debug, Error)]
pub enum ProvdError {
    #[error("lock contention: {0}")]
    LockContention(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("unpack error: {0}")]
    Unpack(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProvdError {
    /// True for errors that abort a run because its cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvdError::Cancelled)
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for ProvdError {
    fn from(err: std::io::Error) -> Self {
        ProvdError::Internal(format!("I/O error: {}", err))
    }
}

impl From<rusqlite::Error> for ProvdError {
    fn from(err: rusqlite::Error) -> Self {
        ProvdError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ProvdError {
    fn from(err: serde_json::Error) -> Self {
        ProvdError::Internal(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for ProvdError {
    fn from(err: reqwest::Error) -> Self {
        ProvdError::Fetch(err.to_string())
    }
}

impl From<String> for ProvdError {
    fn from(err: String) -> Self {
        ProvdError::Internal(err)
    }
}

impl From<&str> for ProvdError {
    fn from(err: &str) -> Self {
        ProvdError::Internal(err.to_string())
    }
}
