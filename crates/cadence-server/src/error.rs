//! Error types for the Cadence server

use cadence_core::CoreError;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Request conflicts with the current state of a resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A backing store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(what) => ServerError::NotFound(what),
            CoreError::Validation(msg) => ServerError::ValidationError(msg),
            CoreError::Conflict(msg) => ServerError::Conflict(msg),
            CoreError::StoreUnavailable(msg) => ServerError::StoreUnavailable(msg),
            CoreError::InvalidPolicy(msg) => ServerError::ConfigError(format!("Invalid rate limit policy: {}", msg)),
            CoreError::Configuration(msg) => ServerError::ConfigError(msg),
            CoreError::Serialization(msg) => ServerError::InternalError(msg),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::ValidationError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ServerError {
    fn from(err: serde_yaml::Error) -> Self {
        ServerError::ConfigError(format!("YAML error: {}", err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

impl ServerError {
    /// Check if the error comes from an unreachable store
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, ServerError::StoreUnavailable(_))
    }
}
