//! Test harness for offline channel integration tests.
//!
//! Provides:
//! - MockTransport: scripted collector statuses, records request bodies
//! - SilentDetector: connectivity that changes without notifying subscribers
//! - Harness: key-value store, clock, listener and a bound channel

#![allow(dead_code)]

use async_trait::async_trait;
use offline_batch_handler::{BatchHandler, HandlerResult, SendRequest, Transport, TransportResponse};
use offline_channel::{ManualNetworkDetector, NetworkDetector, OfflineChannel};
use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{DropReason, ManualClock, NotificationManager, OfflineListener, ProviderKind, TelemetryEvent};
use offline_storage::{MemoryKeyValueStore, ProviderContext};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use txn_store_scheduler::{SchedulerConfig, SchedulerRegistry};

pub const ENDPOINT: &str = "https://collector.example.com/OneCollector/1.0";
pub const IKEY: &str = "test-ikey";

pub struct MockTransport {
    statuses: Mutex<VecDeque<u16>>,
    bodies: Mutex<Vec<String>>,
    idle: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(VecDeque::new()),
            bodies: Mutex::new(Vec::new()),
            idle: AtomicBool::new(true),
        }
    }

    /// Statuses returned in order; 200 once exhausted.
    pub fn queue_status(&self, status: u16) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    pub fn sent(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_post(&self, request: SendRequest, _sync: bool) -> HandlerResult<TransportResponse> {
        let body = String::from_utf8_lossy(request.body.as_bytes()).into_owned();
        self.bodies.lock().unwrap().push(body);
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        Ok(TransportResponse::with_status(status))
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }
}

/// Detector whose state flips without any subscriber seeing it.
pub struct SilentDetector {
    online: AtomicBool,
    state: watch::Sender<bool>,
}

impl SilentDetector {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            online: AtomicBool::new(online),
            state,
        }
    }

    pub fn set_online_silently(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl NetworkDetector for SilentDetector {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

#[derive(Default)]
pub struct RecordingListener {
    discarded: Mutex<Vec<(usize, DropReason)>>,
    drops: Mutex<Vec<(usize, DropReason)>>,
}

impl RecordingListener {
    pub fn discarded(&self) -> Vec<(usize, DropReason)> {
        self.discarded.lock().unwrap().clone()
    }

    pub fn drops(&self) -> Vec<(usize, DropReason)> {
        self.drops.lock().unwrap().clone()
    }
}

impl OfflineListener for RecordingListener {
    fn events_discarded(&self, events: &[TelemetryEvent], reason: DropReason) {
        self.discarded.lock().unwrap().push((events.len(), reason));
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
    pub transport: Arc<MockTransport>,
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
            transport: Arc::new(MockTransport::new()),
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

    /// A channel bound to this harness, already initialized.
    pub async fn channel(&self, config: OfflineChannelConfig, detector: Arc<dyn NetworkDetector>) -> OfflineChannel {
        let channel = OfflineChannel::new(BatchHandler::new(), detector);
        let persistent = channel
            .initialize(self.context(config), self.transport.clone())
            .await
            .unwrap();
        assert!(persistent);
        channel
    }
}

/// Blob-backed config with short timers.
pub fn config() -> OfflineChannelConfig {
    OfflineChannelConfig {
        providers: vec![ProviderKind::Blob],
        events_limit_in_mem: 2,
        in_memo_max_time_ms: 1_000,
        send_base_interval_ms: 1_000,
        max_send_batch_interval_ms: 8_000,
        ..OfflineChannelConfig::default()
    }
}

pub fn offline() -> Arc<ManualNetworkDetector> {
    Arc::new(ManualNetworkDetector::new(false))
}

/// Let spawned timer and listener tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
