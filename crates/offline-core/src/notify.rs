//! Best-effort notification fan-out.
//!
//! Listeners never influence control flow: a panicking listener is logged and
//! skipped.

use crate::{BatchSendOutcome, DropReason, TelemetryEvent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Receiver of offline-channel notifications. Every method defaults to a no-op.
pub trait OfflineListener: Send + Sync {
    /// Events were discarded before reaching storage.
    fn events_discarded(&self, _events: &[TelemetryEvent], _reason: DropReason) {}

    /// Events were durably written to a storage provider.
    fn offline_events_stored(&self, _events: &[TelemetryEvent]) {}

    /// A stored batch was handed to the transport.
    fn offline_batch_sent(&self, _outcome: &BatchSendOutcome) {}

    /// Stored events were dropped (eviction, age, non-retriable status).
    fn offline_batch_drop(&self, _count: usize, _reason: DropReason) {}
}

/// Shared list of listeners. Cheap to clone.
#[derive(Clone, Default)]
pub struct NotificationManager {
    listeners: Arc<RwLock<Vec<Arc<dyn OfflineListener>>>>,
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl NotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn OfflineListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn OfflineListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn events_discarded(&self, events: &[TelemetryEvent], reason: DropReason) {
        if events.is_empty() {
            return;
        }
        self.dispatch("events_discarded", |l| l.events_discarded(events, reason));
    }

    pub fn offline_events_stored(&self, events: &[TelemetryEvent]) {
        if events.is_empty() {
            return;
        }
        self.dispatch("offline_events_stored", |l| l.offline_events_stored(events));
    }

    pub fn offline_batch_sent(&self, outcome: &BatchSendOutcome) {
        self.dispatch("offline_batch_sent", |l| l.offline_batch_sent(outcome));
    }

    pub fn offline_batch_drop(&self, count: usize, reason: DropReason) {
        if count == 0 {
            return;
        }
        self.dispatch("offline_batch_drop", |l| l.offline_batch_drop(count, reason));
    }

    fn dispatch(&self, name: &str, f: impl Fn(&dyn OfflineListener)) {
        let listeners: Vec<Arc<dyn OfflineListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!(notification = name, "Offline listener panicked, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PersistenceLevel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        drops: Mutex<Vec<(usize, DropReason)>>,
    }

    impl OfflineListener for Recorder {
        fn offline_batch_drop(&self, count: usize, reason: DropReason) {
            self.drops.lock().unwrap().push((count, reason));
        }
    }

    struct Panicker;

    impl OfflineListener for Panicker {
        fn offline_events_stored(&self, _events: &[TelemetryEvent]) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_drop_notification_reaches_listener() {
        let manager = NotificationManager::new();
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(recorder.clone());

        manager.offline_batch_drop(2, DropReason::MaxAgeExceeded);
        manager.offline_batch_drop(0, DropReason::MaxAgeExceeded);

        let drops = recorder.drops.lock().unwrap();
        assert_eq!(drops.as_slice(), &[(2, DropReason::MaxAgeExceeded)]);
    }

    #[test]
    fn test_panicking_listener_is_swallowed() {
        let manager = NotificationManager::new();
        manager.add_listener(Arc::new(Panicker));
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(recorder.clone());

        let event = TelemetryEvent::new("k", PersistenceLevel::Normal, "x");
        manager.offline_events_stored(&[event]);
        manager.offline_batch_drop(1, DropReason::StorageFull);

        assert_eq!(recorder.drops.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let manager = NotificationManager::new();
        let listener: Arc<dyn OfflineListener> = Arc::new(Recorder::default());
        manager.add_listener(listener.clone());
        assert_eq!(manager.listener_count(), 1);

        manager.remove_listener(&listener);
        assert_eq!(manager.listener_count(), 0);
    }
}
