//! Bounded in-memory buffer of events waiting to be flushed to storage.

use offline_core::TelemetryEvent;
use tracing::warn;

/// Ordered, capacity-limited event buffer bound to one endpoint.
#[derive(Debug, Clone)]
pub struct InMemoryBatch {
    endpoint: String,
    events: Vec<TelemetryEvent>,
    limit: usize,
    warned: bool,
}

impl InMemoryBatch {
    pub fn new(endpoint: impl Into<String>, limit: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            events: Vec::new(),
            limit,
            warned: false,
        }
    }

    /// Append an event. Returns false once the limit is reached; the first
    /// rejection logs a warning, later ones are silent.
    pub fn add_event(&mut self, event: TelemetryEvent) -> bool {
        self.try_add(event).is_ok()
    }

    /// Like [`add_event`](Self::add_event), handing a rejected event back.
    pub fn try_add(&mut self, event: TelemetryEvent) -> Result<(), TelemetryEvent> {
        if self.events.len() >= self.limit {
            if !self.warned {
                self.warned = true;
                warn!(
                    endpoint = %self.endpoint,
                    limit = self.limit,
                    "In-memory offline buffer is full, rejecting events"
                );
            }
            return Err(event);
        }
        self.events.push(event);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Count plus the summed size estimate of every event.
    pub fn size(&self) -> usize {
        self.events.len() + self.events.iter().map(TelemetryEvent::size_estimate).sum::<usize>()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn events(&self) -> &[TelemetryEvent] {
        &self.events
    }

    /// Move events `[from_idx, from_idx + n)` (or everything from `from_idx`
    /// when `n` is `None`) into a new batch, keeping the rest in place.
    pub fn split(&mut self, from_idx: usize, n: Option<usize>) -> InMemoryBatch {
        let start = from_idx.min(self.events.len());
        let end = match n {
            Some(n) => start.saturating_add(n).min(self.events.len()),
            None => self.events.len(),
        };
        let taken: Vec<TelemetryEvent> = self.events.drain(start..end).collect();
        InMemoryBatch {
            endpoint: self.endpoint.clone(),
            events: taken,
            limit: self.limit,
            warned: false,
        }
    }

    /// A fresh buffer for `endpoint`, seeded with `events` up to the limit.
    /// `limit` defaults to this buffer's limit.
    pub fn create_new(
        &self,
        endpoint: impl Into<String>,
        events: Option<Vec<TelemetryEvent>>,
        limit: Option<usize>,
    ) -> InMemoryBatch {
        let mut batch = InMemoryBatch::new(endpoint, limit.unwrap_or(self.limit));
        for event in events.unwrap_or_default() {
            if !batch.add_event(event) {
                break;
            }
        }
        batch
    }

    /// Remove and return every buffered event.
    pub fn take_all(&mut self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Put events back at the front, ahead of anything added since they were
    /// taken. Returns the events that no longer fit.
    pub fn restore(&mut self, events: Vec<TelemetryEvent>) -> Vec<TelemetryEvent> {
        let room = self.limit.saturating_sub(self.events.len());
        let mut events = events;
        let overflow = if events.len() > room {
            events.split_off(room)
        } else {
            Vec::new()
        };
        self.events.splice(0..0, events);
        overflow
    }
}
