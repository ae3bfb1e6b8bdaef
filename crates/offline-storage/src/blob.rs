//! Event storage in a single serialized blob on a synchronous key-value store.
//!
//! The whole per-endpoint state lives under one key as
//! `{"lastAccessTime": <ms>, "evts": {"<id>": <event>}}`. Every operation is
//! a read-modify-write of that value and completes without suspending, which
//! makes this provider the guaranteed-sync fallback for unload paths.

use crate::kv::KeyValueStore;
use crate::provider::{resolve_id, ProviderContext, StorageProvider};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{
    ClockHandle, DropReason, EventId, NotificationManager, Payload, PersistenceLevel, ProviderKind,
    TelemetryEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Layout version embedded in the storage key.
pub const BLOB_VERSION: u32 = 1;

/// Serialized blob layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBlob {
    pub last_access_time: i64,
    pub evts: BTreeMap<String, StoredEvent>,
}

/// An event as written into the blob. Binary payloads are base64 text
/// flagged with `isArr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    #[serde(flatten)]
    pub evt: TelemetryEvent,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_arr: bool,
}

impl StoredEvent {
    fn encode(mut evt: TelemetryEvent) -> Self {
        let is_arr = evt.data.is_binary();
        if let Payload::Binary(bytes) = &evt.data {
            evt.data = Payload::Text(BASE64.encode(bytes));
        }
        Self { evt, is_arr }
    }

    fn decode(&self) -> StorageResult<TelemetryEvent> {
        let mut evt = self.evt.clone();
        if self.is_arr {
            let Payload::Text(encoded) = &evt.data else {
                return Err(StorageError::Corrupt(format!("event {} flagged binary without text body", evt.id)));
            };
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| StorageError::Corrupt(format!("event {}: {e}", evt.id)))?;
            evt.data = Payload::Binary(bytes);
        }
        Ok(evt)
    }

    fn timestamp(&self) -> i64 {
        EventId::sort_key(&self.evt.id).0
    }
}

struct BlobState {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    config: Arc<OfflineChannelConfig>,
    clock: ClockHandle,
    notifier: NotificationManager,
}

impl BlobState {
    /// Parse the blob; an unreadable value is deleted and treated as empty.
    fn load(&self) -> StorageResult<StorageBlob> {
        let Some(raw) = self.kv.get_item(&self.key)? else {
            return Ok(StorageBlob::default());
        };
        match serde_json::from_str::<StorageBlob>(&raw) {
            Ok(blob) => Ok(blob),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Stored blob is corrupt, deleting it");
                self.kv.remove_item(&self.key)?;
                Ok(StorageBlob::default())
            }
        }
    }

    /// Serialize and write; on failure the key is dropped rather than left stale.
    fn save_or_reset(&self, blob: &StorageBlob) -> StorageResult<()> {
        let result = serde_json::to_string(blob)
            .map_err(StorageError::from)
            .and_then(|json| self.kv.set_item(&self.key, &json));
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "Failed to write blob, deleting it");
            self.kv.remove_item(&self.key)?;
            return Err(e);
        }
        Ok(())
    }

    /// Events in insertion-time order, skipping undecodable entries.
    fn ordered_events(blob: &StorageBlob, limit: usize) -> Vec<TelemetryEvent> {
        let mut entries: Vec<&StoredEvent> = blob.evts.values().collect();
        entries.sort_by(|a, b| EventId::sort_key(&a.evt.id).cmp(&EventId::sort_key(&b.evt.id)));
        entries
            .into_iter()
            .filter_map(|stored| match stored.decode() {
                Ok(evt) => Some(evt),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable event");
                    None
                }
            })
            .take(limit)
            .collect()
    }

    fn add(&self, mut event: TelemetryEvent, key: &str) -> StorageResult<TelemetryEvent> {
        resolve_id(key, &mut event, &self.clock);
        let new_id = event.id.clone();
        let max_bytes = self.config.max_storage_size_in_bytes;

        let mut blob = self.load()?;
        blob.last_access_time = self.clock.now_ms();
        blob.evts.insert(new_id.clone(), StoredEvent::encode(event.clone()));

        let mut evicted = 0;
        let mut critical_evicted = 0;
        loop {
            let json = serde_json::to_string(&blob)?;
            if json.len() as u64 <= max_bytes {
                match self.kv.set_item(&self.key, &json) {
                    Ok(()) => break,
                    Err(e) if e.is_store_full() => {
                        debug!(key = %self.key, error = %e, "Backend quota hit, evicting");
                    }
                    Err(e) => return Err(e),
                }
            }

            let dropped = self.evict_step(&mut blob, &new_id, &mut critical_evicted);
            if dropped == 0 {
                warn!(id = %new_id, evicted, "Blob full, event rejected");
                return Err(StorageError::StoreFull(format!(
                    "no room for event {new_id} within {max_bytes} bytes"
                )));
            }
            evicted += dropped;
        }

        if evicted > 0 {
            self.notifier.offline_batch_drop(evicted, DropReason::StorageFull);
        }
        debug!(id = %new_id, evicted, "Event stored in blob");
        Ok(event)
    }

    /// Drop one eviction step's worth of entries, never `keep`.
    ///
    /// Normal entries go first, lowest `criticalCnt` then oldest. Critical
    /// entries follow only once no Normal entry is left, and at most
    /// `max_critical_evts_drop_cnt` of them per write.
    fn evict_step(&self, blob: &mut StorageBlob, keep: &str, critical_evicted: &mut usize) -> usize {
        let per_step = self.config.events_to_drop_per_time.max(1);

        let mut normal: Vec<(u32, i64, String)> = blob
            .evts
            .iter()
            .filter(|(id, e)| id.as_str() != keep && e.evt.persistence == PersistenceLevel::Normal)
            .map(|(id, e)| (e.evt.critical_cnt, e.timestamp(), id.clone()))
            .collect();

        let victims: Vec<String> = if !normal.is_empty() {
            normal.sort();
            normal.into_iter().take(per_step).map(|(_, _, id)| id).collect()
        } else {
            let allowance = self
                .config
                .max_critical_evts_drop_cnt
                .saturating_sub(*critical_evicted)
                .min(per_step);
            let mut critical: Vec<(u32, i64, String)> = blob
                .evts
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .map(|(id, e)| (e.evt.critical_cnt, e.timestamp(), id.clone()))
                .collect();
            critical.sort();
            let victims: Vec<String> = critical.into_iter().take(allowance).map(|(_, _, id)| id).collect();
            *critical_evicted += victims.len();
            victims
        };

        for id in &victims {
            blob.evts.remove(id);
        }
        victims.len()
    }
}

/// Provider that keeps all events of one endpoint in one key-value entry.
#[derive(Default)]
pub struct BlobStorageProvider {
    state: Mutex<Option<BlobState>>,
}

impl BlobStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage key for a context: `<prefix>_<version>_<endpointDomain>`.
    pub fn storage_key_for(ctx: &ProviderContext) -> String {
        format!(
            "{}_{}_{}",
            ctx.config.storage_key_prefix,
            BLOB_VERSION,
            ctx.endpoint_domain()
        )
    }

    /// Run `f` with exclusive access to the bound state.
    ///
    /// The lock spans the whole read-modify-write so concurrent callers on
    /// other threads cannot interleave.
    fn with_state<T>(&self, f: impl FnOnce(&BlobState) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self
            .state
            .lock()
            .map_err(|_| StorageError::KeyValue("blob provider lock poisoned".to_string()))?;
        let state = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        f(state)
    }

    fn clean_now(&self, disable: bool) -> StorageResult<bool> {
        self.with_state(|state| {
            if disable {
                let blob = state.load()?;
                let dropped = blob.evts.len();
                state.kv.remove_item(&state.key)?;
                if dropped > 0 {
                    state.notifier.offline_batch_drop(dropped, DropReason::Disabled);
                }
                return Ok(dropped > 0);
            }

            let mut blob = state.load()?;
            let now = state.clock.now_ms();
            let max_age = state.config.in_storage_max_time_ms;

            let mut aged: Vec<(i64, String)> = blob
                .evts
                .iter()
                .filter_map(|(id, _)| EventId::timestamp_of(id).map(|ts| (ts, id.clone())))
                .filter(|(ts, _)| now - ts > max_age)
                .collect();
            aged.sort();
            aged.truncate(state.config.max_clean_batch.max(1));

            if aged.is_empty() {
                return Ok(false);
            }
            for (_, id) in &aged {
                blob.evts.remove(id);
            }
            blob.last_access_time = now;
            state.save_or_reset(&blob)?;

            state
                .notifier
                .offline_batch_drop(aged.len(), DropReason::MaxAgeExceeded);
            info!(dropped = aged.len(), "Aged events purged from blob");
            Ok(true)
        })
    }
}

#[async_trait]
impl StorageProvider for BlobStorageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Blob
    }

    async fn initialize(&self, ctx: &ProviderContext) -> bool {
        let key = Self::storage_key_for(ctx);

        // check the backend is usable before committing to it
        if let Err(e) = ctx.kv_store.get_item(&key) {
            warn!(key = %key, error = %e, "Key-value store unavailable");
            return false;
        }

        let state = BlobState {
            kv: ctx.kv_store.clone(),
            key: key.clone(),
            config: ctx.config.clone(),
            clock: ctx.clock.clone(),
            notifier: ctx.notifier.clone(),
        };
        match self.state.lock() {
            Ok(mut slot) => *slot = Some(state),
            Err(_) => return false,
        }

        if ctx.config.auto_clean {
            if let Err(e) = self.clean_now(false) {
                warn!(key = %key, error = %e, "Initial clean failed");
            }
        }

        info!(key = %key, "Blob provider initialized");
        true
    }

    fn supports_sync_requests(&self) -> bool {
        true
    }

    async fn add_event(&self, key: &str, event: TelemetryEvent) -> StorageResult<TelemetryEvent> {
        self.with_state(|state| state.add(event, key))
    }

    async fn get_next_batch(&self) -> StorageResult<Vec<TelemetryEvent>> {
        self.with_state(|state| Ok(BlobState::ordered_events(&state.load()?, 1)))
    }

    async fn get_all_events(&self, limit: Option<usize>) -> StorageResult<Vec<TelemetryEvent>> {
        self.with_state(|state| {
            Ok(BlobState::ordered_events(
                &state.load()?,
                limit.unwrap_or(usize::MAX),
            ))
        })
    }

    async fn remove_events(&self, events: &[TelemetryEvent]) -> StorageResult<Vec<TelemetryEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.with_state(|state| {
            let mut blob = state.load()?;
            let ids: HashSet<&str> = events.iter().map(|e| e.id.as_str()).collect();
            let removed: Vec<TelemetryEvent> = events
                .iter()
                .filter(|e| blob.evts.contains_key(&e.id))
                .cloned()
                .collect();
            blob.evts.retain(|id, _| !ids.contains(id.as_str()));
            blob.last_access_time = state.clock.now_ms();
            state.save_or_reset(&blob)?;
            Ok(removed)
        })
    }

    async fn clear(&self) -> StorageResult<Vec<TelemetryEvent>> {
        self.with_state(|state| {
            let blob = state.load()?;
            let events = BlobState::ordered_events(&blob, usize::MAX);
            state.kv.remove_item(&state.key)?;
            Ok(events)
        })
    }

    async fn clean(&self, disable: bool) -> StorageResult<bool> {
        self.clean_now(disable)
    }

    async fn teardown(&self) {
        if let Ok(mut slot) = self.state.lock() {
            if let Some(state) = slot.take() {
                debug!(key = %state.key, "Blob provider torn down");
            }
        }
    }
}
