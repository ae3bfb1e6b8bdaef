//! Shared types for the offline telemetry channel.
//!
//! This crate provides:
//! - `TelemetryEvent`, `Payload`, `PersistenceLevel`: the event model
//! - `EventId`: time-ordered `<epochMillis>.<suffix>` ids
//! - Store/send/clean outcome enums and drop reasons
//! - `Clock`: injectable wall clock
//! - `NotificationManager`: best-effort listener fan-out

mod clock;
mod event;
mod id;
mod notify;
mod outcome;

pub use clock::{system_clock, Clock, ClockHandle, ManualClock, SystemClock};
pub use event::{Payload, PersistenceLevel, TelemetryEvent};
pub use id::EventId;
pub use notify::{NotificationManager, OfflineListener};
pub use outcome::{
    BatchCleanOutcome, BatchSendOutcome, BatchSendState, BatchStoreOutcome, BatchStoreState,
    DropReason, ProviderKind,
};
