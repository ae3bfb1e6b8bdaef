//! Classification of transport results into complete/retry/drop.

use offline_config_and_utils::OfflineChannelConfig;
use offline_core::DropReason;

/// What to do with an item after one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendVerdict {
    Complete,
    Retry,
    Drop(DropReason),
}

/// Retriable status codes plus the attempt ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    codes: Vec<u16>,
    max_retry: u32,
}

impl RetryPolicy {
    pub fn new(codes: Vec<u16>, max_retry: u32) -> Self {
        Self { codes, max_retry }
    }

    pub fn from_config(config: &OfflineChannelConfig) -> Self {
        Self::new(config.effective_retry_codes(), config.max_retry)
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Whether `status` is transient. The attempt ceiling is not considered.
    pub fn is_retriable_status(&self, status: u16) -> bool {
        self.codes.contains(&status)
    }

    /// Classify one attempt.
    ///
    /// `status` is `None` when the transport failed before a response
    /// arrived; that is treated as transient. `attempt_cnt` already counts
    /// the attempt being classified.
    pub fn classify(&self, status: Option<u16>, attempt_cnt: u32) -> SendVerdict {
        if status == Some(200) {
            return SendVerdict::Complete;
        }
        if attempt_cnt > self.max_retry {
            return SendVerdict::Drop(DropReason::MaxRetryExceeded);
        }
        match status {
            None => SendVerdict::Retry,
            Some(code) if self.is_retriable_status(code) => SendVerdict::Retry,
            Some(_) => SendVerdict::Drop(DropReason::NonRetryableStatus),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OfflineChannelConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offline_config_and_utils::DEFAULT_RETRY_CODES;

    #[test]
    fn test_default_codes() {
        let policy = RetryPolicy::default();
        for code in DEFAULT_RETRY_CODES {
            assert!(policy.is_retriable_status(code));
        }
        assert!(!policy.is_retriable_status(400));
        assert!(!policy.is_retriable_status(404));
    }

    #[test]
    fn test_explicit_codes_replace_defaults() {
        let policy = RetryPolicy::new(vec![500], 2);
        assert_eq!(policy.classify(Some(500), 1), SendVerdict::Retry);
        assert_eq!(policy.classify(Some(500), 2), SendVerdict::Retry);
        assert_eq!(
            policy.classify(Some(500), 3),
            SendVerdict::Drop(DropReason::MaxRetryExceeded)
        );
        assert_eq!(
            policy.classify(Some(503), 1),
            SendVerdict::Drop(DropReason::NonRetryableStatus)
        );
    }

    #[test]
    fn test_success_wins_over_ceiling() {
        let policy = RetryPolicy::new(vec![500], 0);
        assert_eq!(policy.classify(Some(200), 5), SendVerdict::Complete);
    }

    #[test]
    fn test_transport_failure_is_transient_until_ceiling() {
        let policy = RetryPolicy::new(vec![], 1);
        assert_eq!(policy.classify(None, 1), SendVerdict::Retry);
        assert_eq!(
            policy.classify(None, 2),
            SendVerdict::Drop(DropReason::MaxRetryExceeded)
        );
    }
}
