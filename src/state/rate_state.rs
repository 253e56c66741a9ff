use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks the adaptive throttling state of a single site
///
/// Request quotas live in the limiter's `governor` buckets. This structure
/// holds what the buckets do not know about: the adaptive inter-request
/// delay, the server's Retry-After floor and any cooldown imposed on the
/// site.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Adaptive delay between consecutive requests
    pub current_delay: Duration,

    /// No request may start before this instant, from a server Retry-After
    pub retry_after_until: Option<Instant>,

    /// No request may start before this instant
    pub cooldown_until: Option<Instant>,

    pub consecutive_failures: u32,

    pub consecutive_successes: u32,

    /// Total requests granted for this site
    pub request_count: u64,
}

impl RateLimitState {
    /// Creates a state at the configured baseline delay
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            current_delay: config.base_delay(),
            retry_after_until: None,
            cooldown_until: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            request_count: 0,
        }
    }

    /// Latest instant still blocking the site at `now`, if any
    pub fn blocked_until(&self, now: Instant) -> Option<Instant> {
        [self.cooldown_until, self.retry_after_until]
            .into_iter()
            .flatten()
            .filter(|until| *until > now)
            .max()
    }

    pub fn record_request(&mut self) {
        self.request_count += 1;
    }

    /// Pacing delay to apply before the next request
    pub fn next_delay(&self) -> Duration {
        self.current_delay
    }

    /// Grows the adaptive delay after a failed request
    ///
    /// A Retry-After from the server blocks the whole site until it has
    /// elapsed, for every task crawling it.
    pub fn record_failure(
        &mut self,
        config: &RateLimitConfig,
        retry_after: Option<Duration>,
        now: Instant,
    ) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        let grown = self.current_delay.mul_f64(config.growth_factor);
        self.current_delay = grown.min(config.max_delay()).max(config.base_delay());

        if config.respect_retry_after {
            if let Some(retry_after) = retry_after {
                let until = now + retry_after;
                self.retry_after_until = Some(self.retry_after_until.map_or(until, |u| u.max(until)));
            }
        }
    }

    /// Decays the adaptive delay toward the baseline after sustained success
    pub fn record_success(&mut self, config: &RateLimitConfig) {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        if self.consecutive_successes >= config.success_decay_threshold {
            self.consecutive_successes = 0;
            let decayed = self.current_delay.div_f64(config.growth_factor);
            self.current_delay = decayed.max(config.base_delay());
        }
    }

    /// Blocks the site until `until`, never shortening an existing cooldown
    pub fn extend_cooldown(&mut self, until: Instant) {
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }
}
