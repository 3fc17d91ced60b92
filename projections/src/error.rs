//! Projection errors.

use evlog_core::notifier::NotifierError;
use evlog_core::pool::PoolError;
use thiserror::Error;

/// Errors that can occur while running or reading a projection.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// Storage backend error (connection, statement, transaction).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A batch or operation failed validation.
    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    /// The resumable source failed.
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// No dedicated connection could be checked out.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Wake subscription or publish failed.
    #[error(transparent)]
    Notifier(#[from] NotifierError),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
