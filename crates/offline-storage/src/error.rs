//! Storage error types.

use thiserror::Error;
use txn_store_scheduler::SchedulerError;

/// Storage error type.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Transactional store error
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Write rejected because the store is at its size ceiling
    #[error("Storage full: {0}")]
    StoreFull(String),

    /// Stored data could not be parsed
    #[error("Corrupt storage: {0}")]
    Corrupt(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key-value backend error
    #[error("Key-value store error: {0}")]
    KeyValue(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider used before a successful initialize
    #[error("Provider not initialized")]
    NotInitialized,
}

impl StorageError {
    /// True for size-ceiling rejections from either backend.
    pub fn is_store_full(&self) -> bool {
        match self {
            Self::StoreFull(_) => true,
            Self::Scheduler(e) => e.is_store_full(),
            _ => false,
        }
    }
}

/// Result type alias using StorageError.
pub type StorageResult<T> = Result<T, StorageError>;
