//! Error types for the Cadence core
//!
//! Store backends, the limiter and the task queue all report failures through
//! [`CoreError`]. Handler failures have their own type in
//! [`crate::tasks::registry::HandlerError`] because they never escape the worker.

use thiserror::Error;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The backing store (local or shared) could not complete the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Resource already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed rate limit policy
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(format!("JSON error: {}", err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::StoreUnavailable(format!("Redis error: {}", err))
    }
}

impl CoreError {
    /// Check if the error comes from the backing store being unreachable
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable(_))
    }
}
