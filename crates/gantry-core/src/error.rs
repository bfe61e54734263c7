//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Orchestration errors
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Workflow parse error: {0}")]
    Parse(String),

    // Auth errors
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failed operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Database(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
