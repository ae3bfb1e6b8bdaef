//! Explicit outcome enums returned by store/send/clean operations.

use crate::TelemetryEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of persisting one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStoreState {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStoreOutcome {
    pub state: BatchStoreState,
    /// The stored item (with its assigned id) on success, the original item on failure.
    pub item: TelemetryEvent,
}

impl BatchStoreOutcome {
    pub fn success(item: TelemetryEvent) -> Self {
        Self {
            state: BatchStoreState::Success,
            item,
        }
    }

    pub fn failure(item: TelemetryEvent) -> Self {
        Self {
            state: BatchStoreState::Failure,
            item,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == BatchStoreState::Success
    }
}

/// Result of sending the next stored batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchSendState {
    /// Delivered, or nothing was pending.
    Complete,
    /// Transient failure, item was re-queued.
    Retry,
    /// Permanent failure, item was discarded.
    Drop,
    /// The batch could not be prepared (e.g. removal from storage failed).
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSendOutcome {
    pub state: BatchSendState,
    /// Events the outcome refers to; empty when nothing was pending.
    pub data: Vec<TelemetryEvent>,
    /// Last transport status observed, if a send was attempted.
    pub status: Option<u16>,
}

impl BatchSendOutcome {
    pub fn no_data() -> Self {
        Self {
            state: BatchSendState::Complete,
            data: Vec::new(),
            status: None,
        }
    }

    pub fn failure(data: Vec<TelemetryEvent>) -> Self {
        Self {
            state: BatchSendState::Failure,
            data,
            status: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == BatchSendState::Complete
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchCleanOutcome {
    pub dropped_count: usize,
}

/// Why events left the offline channel without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    MaxAgeExceeded,
    StorageFull,
    NonRetryableStatus,
    MaxRetryExceeded,
    Corrupted,
    BufferFull,
    Disabled,
}

impl DropReason {
    /// Stable numeric code reported to listeners.
    pub fn code(self) -> u32 {
        match self {
            Self::MaxAgeExceeded => 1,
            Self::StorageFull => 2,
            Self::NonRetryableStatus => 3,
            Self::MaxRetryExceeded => 4,
            Self::Corrupted => 5,
            Self::BufferFull => 6,
            Self::Disabled => 7,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MaxAgeExceeded => "max_age_exceeded",
            Self::StorageFull => "storage_full",
            Self::NonRetryableStatus => "non_retryable_status",
            Self::MaxRetryExceeded => "max_retry_exceeded",
            Self::Corrupted => "corrupted",
            Self::BufferFull => "buffer_full",
            Self::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Storage provider variants, in the order a host may prefer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// SQLite-backed provider driven through the transaction scheduler.
    Transactional,
    /// Single-blob provider on a synchronous key-value store.
    Blob,
    /// Host-supplied provider.
    Custom,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transactional => write!(f, "transactional"),
            Self::Blob => write!(f, "blob"),
            Self::Custom => write!(f, "custom"),
        }
    }
}
