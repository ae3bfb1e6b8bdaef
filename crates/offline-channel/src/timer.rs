//! Cancellable one-shot timers that never interrupt a running callback.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct SlotState {
    generation: AtomicU64,
    armed: AtomicBool,
}

/// A single logical timer.
///
/// Each `schedule` supersedes the previous one by bumping a generation
/// counter; a superseded or cancelled timer wakes, sees a stale generation
/// and does nothing. A callback that already started runs to completion, so
/// storage work in flight is never cut off.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerSlot {
    state: Arc<SlotState>,
}

impl TimerSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire(generation)` after `delay` unless superseded first.
    pub(crate) fn schedule<F, Fut>(&self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.armed.store(true, Ordering::SeqCst);

        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if state.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            on_fire(generation).await;
        });
        generation
    }

    pub(crate) fn cancel(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.armed.store(false, Ordering::SeqCst);
    }

    /// Mark idle, unless something rescheduled since `generation` fired.
    pub(crate) fn disarm(&self, generation: u64) {
        if self.is_current(generation) {
            self.state.armed.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.state.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::SeqCst)
    }
}
