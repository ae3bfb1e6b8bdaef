//! Scheduler error types.

use std::time::Duration;
use thiserror::Error;

/// Scheduler error type.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Native connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// The database (or the whole registry) was closed
    #[error("Database closed: {0}")]
    Closed(String),

    /// Store is missing or older and no upgrade handler was supplied
    #[error("Upgrade from version {current} to {requested} required but no upgrade handler supplied")]
    UpgradeRequired { current: u32, requested: u32 },

    /// Store on disk is newer than the requested version
    #[error("Stored version {found} is newer than requested version {requested}")]
    VersionMismatch { found: u32, requested: u32 },

    /// A queued task or cursor step exceeded its deadline
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    /// Table or column name rejected
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure raised by caller-supplied code
    #[error("Task failed: {0}")]
    Task(String),
}

impl SchedulerError {
    /// True when the handle behind this error can no longer be used.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// True when the native store refused a write for lack of space.
    pub fn is_store_full(&self) -> bool {
        match self {
            Self::Sqlite(e) => e.sqlite_error_code() == Some(rusqlite::ErrorCode::DiskFull),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(..))
    }
}

/// Convert a tokio_rusqlite::Error to SchedulerError.
pub(crate) fn from_tokio_rusqlite(db_name: &str, e: tokio_rusqlite::Error) -> SchedulerError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => SchedulerError::Sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => SchedulerError::Closed(db_name.to_string()),
        tokio_rusqlite::Error::Close(_) => SchedulerError::Closed(db_name.to_string()),
        other => SchedulerError::Connection(other.to_string()),
    }
}

/// Result type alias using SchedulerError.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
