//! Error types for the automation engine.
//!
//! Lookups that find nothing return `Option`, and a missed event deadline is a
//! `PlanOutcome`, so everything here is a genuine failure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutomationError {
    /// Catalog or queue store query failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Media open, decode or output device failures
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored row that cannot be turned back into a model
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The planning worker pool was closed or a worker task died
    #[error("Worker error: {0}")]
    Worker(String),
}

impl From<tokio::sync::AcquireError> for AutomationError {
    fn from(e: tokio::sync::AcquireError) -> Self {
        AutomationError::Worker(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AutomationError {
    fn from(e: tokio::task::JoinError) -> Self {
        AutomationError::Worker(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AutomationError>;
