use super::{CrawlError, ErrorCategory, ErrorKind};
use crate::config::RetryConfig;
use std::time::Duration;

/// Hard ceiling on any single backoff
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Anti-bot errors retry at most this many times
const ANTIBOT_RETRY_LIMIT: u32 = 2;

/// Unclassified errors retry at most once
const UNKNOWN_RETRY_LIMIT: u32 = 1;

/// Decides whether a failed step is retried, and how long to wait first
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Returns whether another attempt should be made
    ///
    /// # Arguments
    ///
    /// * `error` - The classified failure of the attempt that just ran
    /// * `attempt` - Number of attempts already made (1 after the first try)
    /// * `max_attempts` - Upper bound on attempts for this step
    pub fn should_retry(&self, error: &CrawlError, attempt: u32, max_attempts: u32) -> bool {
        if attempt >= max_attempts || !error.recoverable {
            return false;
        }

        match error.kind.category() {
            ErrorCategory::Network => true,
            ErrorCategory::AntiBot => match error.kind {
                ErrorKind::RateLimited | ErrorKind::Blocked => attempt <= ANTIBOT_RETRY_LIMIT,
                // Captcha pages are skipped; IP bans wait for the site cooldown
                _ => false,
            },
            // Extraction retries belong to the extractor
            ErrorCategory::Extraction => false,
            ErrorCategory::Configuration | ErrorCategory::Lifecycle => false,
            ErrorCategory::Unclassified => attempt <= UNKNOWN_RETRY_LIMIT,
        }
    }

    /// Exponential backoff for the given attempt: `base * 2^attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .min(BACKOFF_CAP)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(kind: ErrorKind) -> CrawlError {
        CrawlError::new(kind, Some("a"), "test")
    }

    #[test]
    fn test_ip_ban_never_retried() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert!(!policy.should_retry(&error(ErrorKind::IpBanned), attempt, 100));
        }
    }

    #[test]
    fn test_network_errors_retry_up_to_max() {
        let policy = RetryPolicy::default();
        let err = error(ErrorKind::Network);
        assert!(policy.should_retry(&err, 1, 3));
        assert!(policy.should_retry(&err, 2, 3));
        assert!(!policy.should_retry(&err, 3, 3));

        assert!(policy.should_retry(&error(ErrorKind::Timeout), 4, 5));
    }

    #[test]
    fn test_antibot_errors_retry_at_most_twice() {
        let policy = RetryPolicy::default();
        for kind in [ErrorKind::RateLimited, ErrorKind::Blocked] {
            let err = error(kind);
            assert!(policy.should_retry(&err, 1, 10));
            assert!(policy.should_retry(&err, 2, 10));
            assert!(!policy.should_retry(&err, 3, 10));
        }
        assert!(!policy.should_retry(&error(ErrorKind::CaptchaRequired), 1, 10));
    }

    #[test]
    fn test_unknown_retries_once() {
        let policy = RetryPolicy::default();
        let err = error(ErrorKind::Unknown);
        assert!(policy.should_retry(&err, 1, 10));
        assert!(!policy.should_retry(&err, 2, 10));
    }

    #[test]
    fn test_non_recoverable_and_config_never_retried() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&error(ErrorKind::MissingSelector), 0, 10));
        assert!(!policy.should_retry(&CrawlError::cancelled(), 0, 10));
        assert!(!policy.should_retry(&error(ErrorKind::ParseError), 0, 10));

        let mut err = error(ErrorKind::Network);
        err.recoverable = false;
        assert!(!policy.should_retry(&err, 0, 10));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(&RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        });
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_respects_configured_max() {
        let policy = RetryPolicy::new(&RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 500,
        });
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
    }
}
