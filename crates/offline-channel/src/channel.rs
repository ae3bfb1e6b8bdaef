//! Online/offline orchestration: buffering, flushing to storage and draining
//! stored batches when connectivity returns.

use crate::backoff::SendBackoff;
use crate::detector::NetworkDetector;
use crate::in_memory_batch::InMemoryBatch;
use crate::timer::TimerSlot;
use crate::ChannelResult;
use offline_batch_handler::{BatchHandler, Transport};
use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{DropReason, Payload, PersistenceLevel, TelemetryEvent};
use offline_storage::ProviderContext;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What `process_telemetry` did with an item.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Not buffered; the caller sends it through the regular pipeline.
    PassThrough(TelemetryEvent),
    /// Held in memory until the next flush.
    Buffered,
    /// Discarded because the buffer stayed full.
    Dropped(TelemetryEvent),
}

#[derive(Clone)]
struct Binding {
    ctx: ProviderContext,
    transport: Arc<dyn Transport>,
}

impl Binding {
    fn config(&self) -> &OfflineChannelConfig {
        &self.ctx.config
    }
}

/// Per-chunk flush result.
#[derive(Debug, Default, Clone, Copy)]
struct FlushReport {
    stored: usize,
    failed: bool,
    remaining: bool,
}

struct Inner {
    handler: BatchHandler,
    detector: Arc<dyn NetworkDetector>,
    binding: RwLock<Option<Binding>>,
    persistent: AtomicBool,
    buffers: Mutex<BTreeMap<PersistenceLevel, InMemoryBatch>>,
    flush_timer: TimerSlot,
    send_timer: TimerSlot,
    backoff: Mutex<SendBackoff>,
    last_purge: Mutex<Option<Instant>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Offline telemetry channel.
///
/// While online, items pass straight through. While offline, cache-eligible
/// items are buffered in memory and periodically flushed into durable
/// storage; once back online a send timer drains storage through the
/// transport with backoff on failure.
pub struct OfflineChannel {
    inner: Arc<Inner>,
}

impl OfflineChannel {
    pub fn new(handler: BatchHandler, detector: Arc<dyn NetworkDetector>) -> Self {
        let defaults = OfflineChannelConfig::default();
        Self {
            inner: Arc::new(Inner {
                handler,
                detector,
                binding: RwLock::new(None),
                persistent: AtomicBool::new(false),
                buffers: Mutex::new(BTreeMap::new()),
                flush_timer: TimerSlot::new(),
                send_timer: TimerSlot::new(),
                backoff: Mutex::new(SendBackoff::new(
                    defaults.send_base_interval(),
                    defaults.max_send_batch_interval(),
                )),
                last_purge: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Bind to an endpoint and transport, select storage and start
    /// listening for connectivity changes.
    ///
    /// Returns whether persistence is enabled. Without it the channel passes
    /// every item through.
    pub async fn initialize(&self, ctx: ProviderContext, transport: Arc<dyn Transport>) -> ChannelResult<bool> {
        ctx.config.validate()?;
        let inner = &self.inner;

        let persistent = inner.handler.initialize(&ctx).await;
        inner.persistent.store(persistent, Ordering::SeqCst);
        if let Ok(mut backoff) = inner.backoff.lock() {
            *backoff = SendBackoff::new(ctx.config.send_base_interval(), ctx.config.max_send_batch_interval());
        }
        inner.reset_purge();
        info!(endpoint = %ctx.endpoint, persistent, "Offline channel initialized");

        inner.set_binding(Some(Binding { ctx, transport }));
        inner.start_listener();

        if persistent && inner.detector.is_online() {
            inner.schedule_send(Duration::ZERO);
        }
        Ok(persistent)
    }

    /// Route one item. Online, unbound or non-persistent channels pass it
    /// through; otherwise cache-eligible items are buffered.
    pub async fn process_telemetry(&self, item: TelemetryEvent) -> ProcessOutcome {
        self.inner.process_telemetry(item).await
    }

    /// Flush every buffered event to storage now. Returns how many were stored.
    pub async fn flush_now(&self) -> usize {
        let inner = &self.inner;
        let mut stored = 0;
        loop {
            let report = inner.flush_once(false).await;
            stored += report.stored;
            if !report.remaining || report.failed || report.stored == 0 {
                break;
            }
        }
        if !inner.has_buffered() {
            inner.flush_timer.cancel();
        }
        stored
    }

    /// Store every buffered event through the unload-capable provider.
    /// Events that cannot be stored are discarded. Returns how many were stored.
    pub async fn unload(&self) -> usize {
        let inner = &self.inner;
        inner.flush_timer.cancel();
        let mut stored = 0;
        loop {
            let report = inner.flush_once(true).await;
            stored += report.stored;
            if !report.remaining {
                break;
            }
            if report.failed || report.stored == 0 {
                let leftover = inner.take_buffered();
                warn!(count = leftover.len(), "Discarding events that could not be unloaded");
                inner.discard(&leftover, DropReason::StorageFull);
                break;
            }
        }
        debug!(stored, "Offline channel unloaded");
        stored
    }

    /// Rebind to a new endpoint. Buffered events carry over; storage is
    /// reselected for the new endpoint.
    pub async fn set_endpoint(&self, endpoint: &str) -> bool {
        let inner = &self.inner;
        let Some(binding) = inner.binding() else {
            return false;
        };

        inner.send_timer.cancel();
        inner.handler.teardown().await;

        let ctx = binding.ctx.clone().with_endpoint(endpoint);
        let persistent = inner.handler.initialize(&ctx).await;
        inner.persistent.store(persistent, Ordering::SeqCst);
        inner.reset_purge();

        if let Ok(mut buffers) = inner.buffers.lock() {
            for buffer in buffers.values_mut() {
                let carried = buffer.take_all();
                *buffer = buffer.create_new(endpoint, Some(carried), None);
            }
        }
        inner.set_binding(Some(Binding { ctx, ..binding }));
        info!(endpoint = %endpoint, persistent, "Offline channel endpoint changed");

        if persistent && inner.detector.is_online() {
            inner.schedule_send(Duration::ZERO);
        }
        persistent
    }

    /// Unload buffered events, stop timers and release storage.
    pub async fn teardown(&self) {
        let inner = &self.inner;
        if inner.persistent.load(Ordering::SeqCst) {
            self.unload().await;
        }
        inner.flush_timer.cancel();
        inner.send_timer.cancel();
        if let Ok(mut listener) = inner.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
        inner.handler.teardown().await;
        inner.persistent.store(false, Ordering::SeqCst);
        inner.set_binding(None);
        info!("Offline channel torn down");
    }

    pub fn is_online(&self) -> bool {
        self.inner.detector.is_online()
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.persistent.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> &BatchHandler {
        &self.inner.handler
    }

    /// Events currently held in memory across all buffers.
    pub fn buffered_count(&self) -> usize {
        self.inner
            .buffers
            .lock()
            .map(|buffers| buffers.values().map(InMemoryBatch::count).sum())
            .unwrap_or(0)
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_flush_timer_active(&self) -> bool {
        self.inner.flush_timer.is_armed()
    }

    pub fn is_send_timer_active(&self) -> bool {
        self.inner.send_timer.is_armed()
    }
}

impl Inner {
    fn binding(&self) -> Option<Binding> {
        self.binding.read().ok().and_then(|b| b.clone())
    }

    fn set_binding(&self, binding: Option<Binding>) {
        if let Ok(mut guard) = self.binding.write() {
            *guard = binding;
        }
    }

    fn has_buffered(&self) -> bool {
        self.buffers
            .lock()
            .map(|buffers| buffers.values().any(|b| !b.is_empty()))
            .unwrap_or(false)
    }

    fn take_buffered(&self) -> Vec<TelemetryEvent> {
        self.buffers
            .lock()
            .map(|mut buffers| buffers.values_mut().flat_map(InMemoryBatch::take_all).collect())
            .unwrap_or_default()
    }

    fn discard(&self, events: &[TelemetryEvent], reason: DropReason) {
        if let Some(binding) = self.binding() {
            binding.ctx.notifier.events_discarded(events, reason);
        }
    }

    async fn process_telemetry(self: &Arc<Self>, item: TelemetryEvent) -> ProcessOutcome {
        let Some(binding) = self.binding() else {
            return ProcessOutcome::PassThrough(item);
        };
        if !self.persistent.load(Ordering::SeqCst) || self.detector.is_online() {
            return ProcessOutcome::PassThrough(item);
        }
        if item.persistence < binding.config().min_persistence_cache_level {
            return ProcessOutcome::PassThrough(item);
        }

        let item = match self.enqueue(&binding, item) {
            Ok(()) => {
                self.ensure_flush_timer(&binding);
                return ProcessOutcome::Buffered;
            }
            Err(item) => item,
        };

        debug!("Buffer full, flushing before retrying the add");
        self.flush_once(false).await;

        match self.enqueue(&binding, item) {
            Ok(()) => {
                self.ensure_flush_timer(&binding);
                ProcessOutcome::Buffered
            }
            Err(item) => {
                binding
                    .ctx
                    .notifier
                    .events_discarded(std::slice::from_ref(&item), DropReason::BufferFull);
                ProcessOutcome::Dropped(item)
            }
        }
    }

    fn buffer_key(config: &OfflineChannelConfig, item: &TelemetryEvent) -> PersistenceLevel {
        if config.split_evts {
            item.persistence
        } else {
            PersistenceLevel::Normal
        }
    }

    fn enqueue(&self, binding: &Binding, item: TelemetryEvent) -> Result<(), TelemetryEvent> {
        let config = binding.config();
        let key = Self::buffer_key(config, &item);
        let Ok(mut buffers) = self.buffers.lock() else {
            return Err(item);
        };
        let buffer = buffers
            .entry(key)
            .or_insert_with(|| InMemoryBatch::new(binding.ctx.endpoint.clone(), config.events_limit_in_mem));
        buffer.try_add(item)
    }

    /// Store one size-capped chunk from each buffer.
    async fn flush_once(self: &Arc<Self>, sync: bool) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(binding) = self.binding() else {
            return report;
        };
        let max_bytes = binding.config().max_batch_size_in_bytes;

        let chunks: Vec<(PersistenceLevel, Vec<TelemetryEvent>)> = match self.buffers.lock() {
            Ok(mut buffers) => buffers
                .iter_mut()
                .filter(|(_, buffer)| !buffer.is_empty())
                .map(|(key, buffer)| {
                    let n = chunk_len(buffer.events(), max_bytes);
                    (*key, buffer.split(0, Some(n)).take_all())
                })
                .collect(),
            Err(_) => return report,
        };

        for (key, events) in chunks {
            let batch = merge_events(&events, &binding.ctx.ikey);
            let outcome = self.handler.store_batch(batch, sync).await;
            if outcome.is_success() {
                debug!(count = events.len(), sync, "Flushed buffered events to storage");
                report.stored += events.len();
                continue;
            }

            report.failed = true;
            if sync {
                self.discard(&events, DropReason::StorageFull);
                continue;
            }
            warn!(count = events.len(), "Failed to store buffered events, keeping them in memory");
            let overflow = match self.buffers.lock() {
                Ok(mut buffers) => match buffers.get_mut(&key) {
                    Some(buffer) => buffer.restore(events),
                    None => events,
                },
                Err(_) => events,
            };
            self.discard(&overflow, DropReason::BufferFull);
        }

        report.remaining = self.has_buffered();
        if report.stored > 0 && self.detector.is_online() && !self.send_timer.is_armed() {
            self.schedule_send(Duration::ZERO);
        }
        report
    }

    fn ensure_flush_timer(self: &Arc<Self>, binding: &Binding) {
        if !self.flush_timer.is_armed() {
            self.schedule_flush(binding.config().in_memo_max_time());
        }
    }

    fn schedule_flush(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.flush_timer.schedule(delay, move |generation| on_flush_timer(weak, generation));
    }

    fn schedule_send(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.send_timer.schedule(delay, move |generation| on_send_timer(weak, generation));
    }

    fn start_listener(self: &Arc<Self>) {
        let mut rx = self.detector.subscribe();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_network_change(online);
            }
        });

        if let Ok(mut listener) = self.listener.lock() {
            if let Some(previous) = listener.replace(handle) {
                previous.abort();
            }
        }
    }

    fn on_network_change(self: &Arc<Self>, online: bool) {
        if online {
            info!("Back online, draining stored batches");
            if let Ok(mut backoff) = self.backoff.lock() {
                backoff.reset();
            }
            if self.persistent.load(Ordering::SeqCst) {
                self.schedule_send(Duration::ZERO);
            }
        } else {
            info!("Went offline, pausing sends");
            self.send_timer.cancel();
        }
    }

    fn reset_purge(&self) {
        if let Ok(mut last) = self.last_purge.lock() {
            *last = None;
        }
    }

    /// Purge aged stored entries, at most once per clean interval.
    async fn purge_if_due(&self, config: &OfflineChannelConfig) {
        let now = Instant::now();
        let due = self
            .last_purge
            .lock()
            .map(|mut last| {
                let due = last.map_or(true, |at| now.duration_since(at) >= config.clean_interval());
                if due {
                    *last = Some(now);
                }
                due
            })
            .unwrap_or(false);
        if due && self.handler.purge_expired().await {
            debug!("Aged stored events purged");
        }
    }

    fn base_send_delay(&self) -> Duration {
        self.backoff.lock().map(|b| b.base()).unwrap_or(Duration::ZERO)
    }

    fn next_backoff_delay(&self) -> Duration {
        self.backoff
            .lock()
            .map(|mut b| b.next_delay())
            .unwrap_or(Duration::ZERO)
    }
}

async fn on_flush_timer(weak: Weak<Inner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let report = inner.flush_once(false).await;
    if !inner.flush_timer.is_current(generation) {
        return;
    }

    let Some(binding) = inner.binding() else {
        inner.flush_timer.disarm(generation);
        return;
    };
    if report.remaining {
        inner.schedule_flush(binding.config().in_memo_max_time());
        return;
    }

    debug!("In-memory buffers empty, flush timer idle");
    inner.flush_timer.disarm(generation);
    // an add may have raced with the disarm
    if inner.has_buffered() {
        inner.ensure_flush_timer(&binding);
    }
}

async fn on_send_timer(weak: Weak<Inner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let Some(binding) = inner.binding() else {
        inner.send_timer.disarm(generation);
        return;
    };

    // read state now, not when the timer was armed
    if !inner.detector.is_online() {
        debug!("Offline at send time, send timer idle");
        inner.send_timer.disarm(generation);
        return;
    }
    inner.purge_if_due(binding.config()).await;
    if !inner.send_timer.is_current(generation) {
        return;
    }
    if !binding.transport.is_idle() {
        debug!("Transport busy, deferring send");
        inner.schedule_send(inner.base_send_delay());
        return;
    }

    let count = binding.config().send_batch_count;
    let outcome = inner
        .handler
        .send_next_batch(binding.transport.as_ref(), false, count)
        .await;
    if !inner.send_timer.is_current(generation) {
        return;
    }

    if !outcome.is_complete() {
        let delay = inner.next_backoff_delay();
        debug!(state = ?outcome.state, delay_ms = delay.as_millis() as u64, "Send failed, backing off");
        inner.schedule_send(delay);
        return;
    }

    if let Ok(mut backoff) = inner.backoff.lock() {
        backoff.reset();
    }
    if outcome.has_data() {
        inner.schedule_send(inner.base_send_delay());
        return;
    }

    inner.send_timer.disarm(generation);
    // a flush may have stored a batch while this send was in flight
    if !inner.send_timer.is_armed() && inner.handler.has_stored_batch().await {
        inner.schedule_send(inner.base_send_delay());
    }
}

/// Number of leading events whose payloads fit in `max_bytes`, joined by
/// newlines. At least one, so an oversized event still moves.
fn chunk_len(events: &[TelemetryEvent], max_bytes: usize) -> usize {
    let mut total = 0usize;
    let mut n = 0;
    for event in events {
        let add = event.size_estimate() + usize::from(n > 0);
        if n > 0 && total + add > max_bytes {
            break;
        }
        total += add;
        n += 1;
    }
    n.max(1).min(events.len())
}

/// Combine buffered events into one stored batch.
fn merge_events(events: &[TelemetryEvent], fallback_ikey: &str) -> TelemetryEvent {
    let ikey = events
        .iter()
        .map(|e| e.ikey.as_str())
        .find(|k| !k.is_empty())
        .unwrap_or(fallback_ikey)
        .to_string();
    let persistence = events
        .iter()
        .map(|e| e.persistence)
        .max()
        .unwrap_or_default();

    let data = if events.iter().all(|e| !e.data.is_binary()) {
        let parts: Vec<&str> = events
            .iter()
            .filter_map(|e| match &e.data {
                Payload::Text(text) => Some(text.as_str()),
                Payload::Binary(_) => None,
            })
            .collect();
        Payload::Text(parts.join("\n"))
    } else {
        let mut bytes = Vec::new();
        for (i, event) in events.iter().enumerate() {
            if i > 0 {
                bytes.push(b'\n');
            }
            bytes.extend_from_slice(event.data.as_bytes());
        }
        Payload::Binary(bytes)
    };

    let mut batch = TelemetryEvent::new(ikey, persistence, data);
    batch.critical_cnt = events.iter().map(|e| e.critical_cnt).sum();
    batch
}
