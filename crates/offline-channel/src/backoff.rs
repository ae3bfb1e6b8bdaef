//! Send retry delays.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for the send timer.
///
/// The ceiling for failure `n` is `base * 2^(n - 1)`, capped at `max`; the
/// actual delay is drawn uniformly from `[ceiling / 2, ceiling]` so clients
/// regaining connectivity together do not resend in lockstep.
#[derive(Debug, Clone)]
pub struct SendBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl SendBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound for the delay after `failures` consecutive failures.
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base;
        }
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let multiplier = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let ceiling_ms = self.ceiling(self.failures).as_millis() as u64;
        let floor_ms = ceiling_ms / 2;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(floor_ms..=ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
