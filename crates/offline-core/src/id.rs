//! Time-ordered event ids of the form `<epochMillis>.<randomSuffix>`.

use crate::Clock;
use rand::distributions::Alphanumeric;
use rand::Rng;

const SUFFIX_LEN: usize = 8;

/// Helpers for building and decoding time-ordered ids.
pub struct EventId;

impl EventId {
    /// Build a new id stamped with the clock's current time.
    pub fn new_time_ordered(clock: &dyn Clock) -> String {
        Self::with_timestamp(clock.now_ms())
    }

    /// Build an id for a specific timestamp.
    pub fn with_timestamp(epoch_ms: i64) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("{epoch_ms}.{suffix}")
    }

    /// Decode the timestamp part of a time-ordered id.
    ///
    /// Returns `None` for ids that were not produced by this scheme.
    pub fn timestamp_of(id: &str) -> Option<i64> {
        let (millis, _) = id.split_once('.')?;
        millis.parse::<i64>().ok()
    }

    /// Sort key for chronological ordering; ids without a timestamp sort last.
    pub fn sort_key(id: &str) -> (i64, &str) {
        (Self::timestamp_of(id).unwrap_or(i64::MAX), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    #[test]
    fn test_id_encodes_timestamp() {
        let clock = ManualClock::new(1_700_000_000_123);
        let id = EventId::new_time_ordered(&clock);

        assert!(id.starts_with("1700000000123."));
        assert_eq!(EventId::timestamp_of(&id), Some(1_700_000_000_123));
    }

    #[test]
    fn test_ids_are_unique_for_same_millisecond() {
        let a = EventId::with_timestamp(5);
        let b = EventId::with_timestamp(5);
        assert_ne!(a, b);
    }

    #[test]
    fn test_foreign_ids_have_no_timestamp() {
        assert_eq!(EventId::timestamp_of("custom-id"), None);
        assert_eq!(EventId::timestamp_of("abc.def"), None);
        assert_eq!(EventId::sort_key("custom-id").0, i64::MAX);
    }
}
