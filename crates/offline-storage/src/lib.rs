//! Durable storage for offline telemetry.
//!
//! This crate provides:
//! - `StorageProvider`: the capability contract every backend implements
//! - `TransactionalStorageProvider`: SQLite store driven by a transaction scheduler
//! - `BlobStorageProvider`: single-blob store on a synchronous key-value backend
//! - `KeyValueStore` backends: in-memory and file-per-key

mod blob;
mod error;
mod kv;
mod provider;
mod transactional;

pub use blob::{BlobStorageProvider, StorageBlob, StoredEvent, BLOB_VERSION};
pub use error::{StorageError, StorageResult};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use provider::{create_provider, ProviderContext, StorageProvider};
pub use transactional::{
    scope_prefix, StorageRecord, TransactionalStorageProvider, DB_NAME_PREFIX,
    SCHEMA_VERSION,
};
