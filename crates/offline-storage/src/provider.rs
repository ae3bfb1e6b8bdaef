//! The storage-provider capability contract.

use crate::blob::BlobStorageProvider;
use crate::kv::KeyValueStore;
use crate::transactional::TransactionalStorageProvider;
use crate::StorageResult;
use async_trait::async_trait;
use offline_config_and_utils::{endpoint_domain, OfflineChannelConfig};
use offline_core::{system_clock, ClockHandle, NotificationManager, ProviderKind, TelemetryEvent};
use std::sync::Arc;
use txn_store_scheduler::SchedulerRegistry;

/// Everything a provider needs to bind itself to one endpoint.
#[derive(Clone)]
pub struct ProviderContext {
    pub endpoint: String,
    pub ikey: String,
    /// Identity of this channel instance; partitions a shared store.
    pub session_id: String,
    pub config: Arc<OfflineChannelConfig>,
    pub clock: ClockHandle,
    pub notifier: NotificationManager,
    pub registry: Arc<SchedulerRegistry>,
    pub kv_store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("endpoint", &self.endpoint)
            .field("ikey", &self.ikey)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ProviderContext {
    /// Context with a fresh session id, the system clock and no listeners.
    pub fn new(
        endpoint: impl Into<String>,
        ikey: impl Into<String>,
        config: Arc<OfflineChannelConfig>,
        registry: Arc<SchedulerRegistry>,
        kv_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            ikey: ikey.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            config,
            clock: system_clock(),
            notifier: NotificationManager::new(),
            registry,
            kv_store,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_clock(mut self, clock: ClockHandle) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: NotificationManager) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Host part of the endpoint, used to scope store names.
    pub fn endpoint_domain(&self) -> String {
        endpoint_domain(&self.endpoint)
    }
}

/// Durable event storage.
///
/// Every variant implements these operations with the same meaning. Blob
/// providers complete without suspending; transactional providers suspend at
/// native I/O. Hosts pick providers through [`create_provider`] or inject
/// their own implementation.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Bind to the context. Returns false when the backend is unusable.
    async fn initialize(&self, ctx: &ProviderContext) -> bool;

    /// Whether every operation completes without waiting on I/O threads.
    fn supports_sync_requests(&self) -> bool;

    /// Persist one event. `key` becomes the id when the event has none;
    /// a time-ordered id is generated when both are empty.
    async fn add_event(&self, key: &str, event: TelemetryEvent) -> StorageResult<TelemetryEvent>;

    /// The earliest pending event, without removing it.
    async fn get_next_batch(&self) -> StorageResult<Vec<TelemetryEvent>>;

    async fn get_all_events(&self, limit: Option<usize>) -> StorageResult<Vec<TelemetryEvent>>;

    /// Remove events by id, returning those that were removed.
    async fn remove_events(&self, events: &[TelemetryEvent]) -> StorageResult<Vec<TelemetryEvent>>;

    /// Remove everything in this provider's scope.
    async fn clear(&self) -> StorageResult<Vec<TelemetryEvent>>;

    /// Purge aged entries. With `disable` the whole scope is dropped.
    /// Returns whether anything was removed.
    async fn clean(&self, disable: bool) -> StorageResult<bool>;

    /// Release backend handles. In-flight operations settle on their own.
    async fn teardown(&self);
}

/// Build a built-in provider for a preference entry.
///
/// `Custom` has no built-in implementation and yields `None`; custom
/// providers are injected into the batch handler directly.
pub fn create_provider(kind: ProviderKind) -> Option<Arc<dyn StorageProvider>> {
    match kind {
        ProviderKind::Transactional => Some(Arc::new(TransactionalStorageProvider::new())),
        ProviderKind::Blob => Some(Arc::new(BlobStorageProvider::new())),
        ProviderKind::Custom => None,
    }
}

/// Resolve the id an event will be stored under.
pub(crate) fn resolve_id(key: &str, event: &mut TelemetryEvent, clock: &ClockHandle) {
    if event.has_id() {
        return;
    }
    event.id = if key.is_empty() {
        offline_core::EventId::new_time_ordered(clock.as_ref())
    } else {
        key.to_string()
    };
}
