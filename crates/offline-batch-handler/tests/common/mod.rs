//! Test harness for batch handler integration tests.
//!
//! Provides:
//! - MockTransport: scripted collector responses, records every request
//! - ScriptedProvider: custom provider over a blob store with injectable failures
//! - Harness: temp dir, scheduler registry, clock, key-value store, listener

#![allow(dead_code)]

use async_trait::async_trait;
use offline_batch_handler::{HandlerError, HandlerResult, SendRequest, Transport, TransportResponse};
use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{
    BatchSendOutcome, DropReason, ManualClock, NotificationManager, OfflineListener, ProviderKind,
    TelemetryEvent,
};
use offline_storage::{
    BlobStorageProvider, MemoryKeyValueStore, ProviderContext, StorageError, StorageProvider,
    StorageResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use txn_store_scheduler::{SchedulerConfig, SchedulerRegistry};

pub const ENDPOINT: &str = "https://collector.example.com/OneCollector/1.0";
pub const IKEY: &str = "test-ikey";

/// Response the mock collector gives.
#[derive(Debug, Clone, Copy)]
pub enum MockResponse {
    Status(u16),
    /// Fail before any status arrives
    NetworkError,
}

/// Transport that answers from a script.
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    default_response: Mutex<MockResponse>,
    received: Mutex<Vec<SendRequest>>,
    idle: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(MockResponse::Status(200)),
            received: Mutex::new(Vec::new()),
            idle: AtomicBool::new(true),
        }
    }

    pub fn set_default_response(&self, response: MockResponse) {
        *self.default_response.lock().unwrap() = response;
    }

    pub fn queue_response(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<SendRequest> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_post(&self, request: SendRequest, _sync: bool) -> HandlerResult<TransportResponse> {
        self.received.lock().unwrap().push(request);
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_response.lock().unwrap());

        match response {
            MockResponse::Status(status) => Ok(TransportResponse::with_status(status)),
            MockResponse::NetworkError => Err(HandlerError::Transport("connection reset".to_string())),
        }
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }
}

/// Custom provider delegating to a blob store.
pub struct ScriptedProvider {
    inner: BlobStorageProvider,
    pub init_ok: bool,
    pub sync: bool,
    pub fail_remove: AtomicBool,
}

impl ScriptedProvider {
    pub fn new(init_ok: bool, sync: bool) -> Self {
        Self {
            inner: BlobStorageProvider::new(),
            init_ok,
            sync,
            fail_remove: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StorageProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    async fn initialize(&self, ctx: &ProviderContext) -> bool {
        self.init_ok && self.inner.initialize(ctx).await
    }

    fn supports_sync_requests(&self) -> bool {
        self.sync
    }

    async fn add_event(&self, key: &str, event: TelemetryEvent) -> StorageResult<TelemetryEvent> {
        self.inner.add_event(key, event).await
    }

    async fn get_next_batch(&self) -> StorageResult<Vec<TelemetryEvent>> {
        self.inner.get_next_batch().await
    }

    async fn get_all_events(&self, limit: Option<usize>) -> StorageResult<Vec<TelemetryEvent>> {
        self.inner.get_all_events(limit).await
    }

    async fn remove_events(&self, events: &[TelemetryEvent]) -> StorageResult<Vec<TelemetryEvent>> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(StorageError::KeyValue("remove rejected".to_string()));
        }
        self.inner.remove_events(events).await
    }

    async fn clear(&self) -> StorageResult<Vec<TelemetryEvent>> {
        self.inner.clear().await
    }

    async fn clean(&self, disable: bool) -> StorageResult<bool> {
        self.inner.clean(disable).await
    }

    async fn teardown(&self) {
        self.inner.teardown().await
    }
}

/// Records notifications.
#[derive(Default)]
pub struct RecordingListener {
    drops: Mutex<Vec<(usize, DropReason)>>,
    stored: Mutex<usize>,
    sent: Mutex<Vec<BatchSendOutcome>>,
}

impl RecordingListener {
    pub fn drops(&self) -> Vec<(usize, DropReason)> {
        self.drops.lock().unwrap().clone()
    }

    pub fn stored(&self) -> usize {
        *self.stored.lock().unwrap()
    }

    pub fn sent(&self) -> Vec<BatchSendOutcome> {
        self.sent.lock().unwrap().clone()
    }
}

impl OfflineListener for RecordingListener {
    fn offline_events_stored(&self, events: &[TelemetryEvent]) {
        *self.stored.lock().unwrap() += events.len();
    }

    fn offline_batch_sent(&self, outcome: &BatchSendOutcome) {
        self.sent.lock().unwrap().push(outcome.clone());
    }

    fn offline_batch_drop(&self, count: usize, reason: DropReason) {
        self.drops.lock().unwrap().push((count, reason));
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<SchedulerRegistry>,
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub listener: Arc<RecordingListener>,
    pub notifier: NotificationManager,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let registry = SchedulerRegistry::new(SchedulerConfig::new(dir.path().join("db")));
        let listener = Arc::new(RecordingListener::default());
        let notifier = NotificationManager::new();
        notifier.add_listener(listener.clone());

        Self {
            dir,
            registry,
            clock: Arc::new(ManualClock::new(1_000)),
            kv: Arc::new(MemoryKeyValueStore::new()),
            listener,
            notifier,
        }
    }

    pub fn context(&self, config: OfflineChannelConfig) -> ProviderContext {
        ProviderContext::new(
            ENDPOINT,
            IKEY,
            Arc::new(config),
            self.registry.clone(),
            self.kv.clone(),
        )
        .with_session_id("session-1")
        .with_clock(self.clock.clone())
        .with_notifier(self.notifier.clone())
    }
}

pub fn blob_only() -> OfflineChannelConfig {
    OfflineChannelConfig {
        providers: vec![ProviderKind::Blob],
        ..OfflineChannelConfig::default()
    }
}

pub fn transactional_only() -> OfflineChannelConfig {
    OfflineChannelConfig {
        providers: vec![ProviderKind::Transactional],
        ..OfflineChannelConfig::default()
    }
}
