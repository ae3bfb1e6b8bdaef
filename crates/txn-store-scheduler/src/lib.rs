//! Ordered access to named transactional stores.
//!
//! Every open, delete and close against a store name runs through one FIFO
//! queue, so operations on the same store never interleave. Stores are
//! SQLite files with object-store tables; schema versions live in
//! `PRAGMA user_version`.
//!
//! # Example
//!
//! ```ignore
//! let registry = SchedulerRegistry::new(SchedulerConfig::new(dir));
//! let scheduler = registry.scheduler("events")?;
//! let count = scheduler
//!     .open_db(1, Some(upgrade), |db| async move {
//!         db.open_store("evts", |store| store.count_prefix("a::")).await
//!     })
//!     .await?;
//! ```

mod cursor;
mod error;
mod handle;
mod registry;
mod scheduler;
mod store;

pub use cursor::{
    drive_cursor, Cursor, CursorEntry, CursorItem, CursorQuery, CursorStep, CursorSummary,
};
pub use error::{SchedulerError, SchedulerResult};
pub use handle::DbHandle;
pub use registry::{SchedulerConfig, SchedulerRegistry};
pub use scheduler::{OpenDb, TransactionScheduler, UpgradeFn};
pub use store::{validate_identifier, StoreTxn};
