//! Common error types for Wayfarer.

use thiserror::Error;

/// Top-level error type for Wayfarer sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote authority unreachable.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote authority answered with an error.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A remote call did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background scheduler is not running.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Gateway(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
