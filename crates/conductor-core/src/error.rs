//! Error types for Conductor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected before any side effect (missing rows, not AI-assignable, ...).
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Attachment error: {0}")]
    Attachment(String),

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orchestrator is paused; new runs are not accepted")]
    Paused,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a run that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Precondition(_) | Self::NotFound(_) | Self::Config(_) | Self::Paused
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
