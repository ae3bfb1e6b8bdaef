#![allow(dead_code)]

use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{DropReason, ManualClock, NotificationManager, OfflineListener};
use offline_storage::{MemoryKeyValueStore, ProviderContext};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use txn_store_scheduler::{SchedulerConfig, SchedulerRegistry};

pub const ENDPOINT: &str = "https://collector.example.com/OneCollector/1.0";
pub const IKEY: &str = "test-ikey";

/// Records drop notifications.
#[derive(Default)]
pub struct RecordingListener {
    drops: Mutex<Vec<(usize, DropReason)>>,
}

impl RecordingListener {
    pub fn drops(&self) -> Vec<(usize, DropReason)> {
        self.drops.lock().unwrap().clone()
    }
}

impl OfflineListener for RecordingListener {
    fn offline_batch_drop(&self, count: usize, reason: DropReason) {
        self.drops.lock().unwrap().push((count, reason));
    }
}

/// Shared fixtures: temp dir, registry, clock, key-value store, listener.
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

    pub fn context(&self, config: OfflineChannelConfig, session_id: &str) -> ProviderContext {
        self.context_for(IKEY, config, session_id)
    }

    pub fn context_for(&self, ikey: &str, config: OfflineChannelConfig, session_id: &str) -> ProviderContext {
        ProviderContext::new(
            ENDPOINT,
            ikey,
            Arc::new(config),
            self.registry.clone(),
            self.kv.clone(),
        )
        .with_session_id(session_id)
        .with_clock(self.clock.clone())
        .with_notifier(self.notifier.clone())
    }
}
