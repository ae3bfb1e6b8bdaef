//! Offline channel orchestration.
//!
//! This crate provides:
//! - OfflineChannel: online/offline state machine with flush and send timers
//! - InMemoryBatch: bounded buffer used while offline
//! - NetworkDetector: connectivity source, with a host-driven ManualNetworkDetector
//! - SendBackoff: jittered exponential delays for failed sends

mod backoff;
mod channel;
mod detector;
mod error;
mod in_memory_batch;
mod timer;

pub use backoff::SendBackoff;
pub use channel::{OfflineChannel, ProcessOutcome};
pub use detector::{ManualNetworkDetector, NetworkDetector};
pub use error::{ChannelError, ChannelResult};
pub use in_memory_batch::InMemoryBatch;
