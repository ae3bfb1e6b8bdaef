//! Batch handler error types.

use thiserror::Error;

/// Batch handler error type.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Storage provider error
    #[error("Storage error: {0}")]
    Storage(#[from] offline_storage::StorageError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure without an HTTP status
    #[error("Transport failed: {0}")]
    Transport(String),
}

/// Result type alias using HandlerError.
pub type HandlerResult<T> = Result<T, HandlerError>;
