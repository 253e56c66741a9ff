//! Per-site rate limiter with adaptive delay
//!
//! Request quotas are `governor` buckets keyed by site id: one per-second
//! bucket that allows a burst, plus per-minute and per-hour buckets. On top
//! of those each site keeps a `RateLimitState` for the adaptive delay, the
//! Retry-After floor and cooldowns. Waiting for a slot is a real suspension.

use crate::config::RateLimitConfig;
use crate::state::RateLimitState;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::Quota;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;

type SiteBucket<C> = governor::RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

/// The three quota buckets shared by every site
struct SiteQuotas<C: Clock = DefaultClock> {
    per_second: SiteBucket<C>,
    per_minute: SiteBucket<C>,
    per_hour: SiteBucket<C>,
}

impl<C: Clock + Clone> SiteQuotas<C> {
    fn with_clock(config: &RateLimitConfig, clock: C) -> Self {
        let bucket = |quota: Quota| SiteBucket::new(quota, DefaultKeyedStateStore::default(), clock.clone());
        Self {
            per_second: bucket(per_second_quota(config)),
            per_minute: bucket(Quota::per_minute(non_zero(config.requests_per_minute))),
            per_hour: bucket(Quota::per_hour(non_zero(config.requests_per_hour))),
        }
    }
}

impl SiteQuotas<DefaultClock> {
    /// Suspends until every bucket grants `site` one cell
    ///
    /// Dropping this mid-wait may leave a cell consumed in the longer
    /// buckets; it never over-grants.
    async fn until_ready(&self, site: &String) {
        self.per_hour.until_key_ready(site).await;
        self.per_minute.until_key_ready(site).await;
        self.per_second.until_key_ready(site).await;
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Steady per-second rate, which may be fractional, with the configured burst
fn per_second_quota(config: &RateLimitConfig) -> Quota {
    let rps = config.requests_per_second;
    let quota = if rps.is_finite() && rps > 0.0 {
        Quota::with_period(Duration::from_secs_f64(1.0 / rps))
    } else {
        None
    };

    quota
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(non_zero(config.burst_size))
}

/// Throttles requests per site
pub struct RateLimiter {
    config: RateLimitConfig,
    quotas: SiteQuotas,
    sites: Mutex<HashMap<String, RateLimitState>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("sites", &self.sites)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            quotas: SiteQuotas::with_clock(&config, DefaultClock::default()),
            config,
            sites: Mutex::new(HashMap::new()),
        }
    }

    /// Suspends until a request to `site` is permitted
    ///
    /// The site must be clear of cooldowns and Retry-After floors, then every
    /// quota bucket must grant a cell. Callers that need cancellation race
    /// this future against their token.
    pub async fn wait_for_slot(&self, site: &str) {
        let key = site.to_string();

        loop {
            if let Some(until) = self.blocked_until(&key) {
                tracing::trace!(
                    site = %site,
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Site blocked, waiting"
                );
                tokio::time::sleep_until(until).await;
                continue;
            }

            self.quotas.until_ready(&key).await;

            // A cooldown may have landed while waiting on the buckets
            let mut sites = self.sites.lock();
            let state = self.state_mut(&mut sites, &key);
            if state.blocked_until(Instant::now()).is_none() {
                state.record_request();
                return;
            }
        }
    }

    fn blocked_until(&self, site: &str) -> Option<Instant> {
        let mut sites = self.sites.lock();
        self.state_mut(&mut sites, site).blocked_until(Instant::now())
    }

    fn state_mut<'a>(
        &self,
        sites: &'a mut HashMap<String, RateLimitState>,
        site: &str,
    ) -> &'a mut RateLimitState {
        sites
            .entry(site.to_string())
            .or_insert_with(|| RateLimitState::new(&self.config))
    }

    /// Returns the pacing delay to apply before the next request to `site`
    pub fn next_delay(&self, site: &str) -> Duration {
        self.sites
            .lock()
            .get(site)
            .map_or(self.config.base_delay(), RateLimitState::next_delay)
    }

    /// Grows the site's delay after a failed request
    pub fn record_failure(&self, site: &str, retry_after: Option<Duration>) {
        let mut sites = self.sites.lock();
        let state = self.state_mut(&mut sites, site);
        state.record_failure(&self.config, retry_after, Instant::now());
        tracing::debug!(
            site = %site,
            delay_ms = state.current_delay.as_millis() as u64,
            failures = state.consecutive_failures,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Increased request delay"
        );
    }

    pub fn record_success(&self, site: &str) {
        let mut sites = self.sites.lock();
        self.state_mut(&mut sites, site).record_success(&self.config);
    }

    /// Blocks all requests to `site` for at least `duration`
    pub fn impose_cooldown(&self, site: &str, duration: Duration) {
        let mut sites = self.sites.lock();
        self.state_mut(&mut sites, site)
            .extend_cooldown(Instant::now() + duration);
    }

    /// Time remaining on the site's cooldown, if any
    pub fn cooldown_remaining(&self, site: &str) -> Option<Duration> {
        let now = Instant::now();
        let sites = self.sites.lock();
        sites
            .get(site)
            .and_then(|s| s.cooldown_until)
            .map(|until| until.saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Copy of the site's current state, for stats
    pub fn snapshot(&self, site: &str) -> Option<RateLimitState> {
        self.sites.lock().get(site).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;
    use std::sync::Arc;

    fn create_test_config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 1.0,
            requests_per_minute: 100,
            requests_per_hour: 1000,
            burst_size: 3,
            ..RateLimitConfig::default()
        }
    }

    /// Takes one cell from every bucket, as `until_ready` would
    fn grant(quotas: &SiteQuotas<FakeRelativeClock>, site: &str) -> bool {
        let key = site.to_string();
        quotas.per_hour.check_key(&key).is_ok()
            && quotas.per_minute.check_key(&key).is_ok()
            && quotas.per_second.check_key(&key).is_ok()
    }

    #[test]
    fn test_burst_then_refill() {
        let clock = FakeRelativeClock::default();
        let quotas = SiteQuotas::with_clock(&create_test_config(), clock.clone());

        for _ in 0..3 {
            assert!(grant(&quotas, "a"));
        }
        // The (burst + 1)th request is refused inside the window
        assert!(!grant(&quotas, "a"));

        clock.advance(Duration::from_millis(500));
        assert!(quotas.per_second.check_key(&"a".to_string()).is_err());

        clock.advance(Duration::from_millis(600));
        assert!(quotas.per_second.check_key(&"a".to_string()).is_ok());
    }

    #[test]
    fn test_fractional_rate() {
        let clock = FakeRelativeClock::default();
        let config = RateLimitConfig {
            requests_per_second: 0.5,
            burst_size: 1,
            ..create_test_config()
        };
        let quotas = SiteQuotas::with_clock(&config, clock.clone());
        let key = "a".to_string();

        assert!(quotas.per_second.check_key(&key).is_ok());
        clock.advance(Duration::from_millis(1500));
        assert!(quotas.per_second.check_key(&key).is_err());
        clock.advance(Duration::from_millis(600));
        assert!(quotas.per_second.check_key(&key).is_ok());
    }

    #[test]
    fn test_minute_quota_limits_sustained_rate() {
        let clock = FakeRelativeClock::default();
        let config = RateLimitConfig {
            requests_per_second: 100.0,
            requests_per_minute: 2,
            burst_size: 100,
            ..create_test_config()
        };
        let quotas = SiteQuotas::with_clock(&config, clock.clone());

        assert!(grant(&quotas, "a"));
        assert!(grant(&quotas, "a"));
        assert!(!grant(&quotas, "a"));

        clock.advance(Duration::from_secs(30));
        assert!(grant(&quotas, "a"));
    }

    #[test]
    fn test_sites_are_independent() {
        let clock = FakeRelativeClock::default();
        let quotas = SiteQuotas::with_clock(&create_test_config(), clock);
        for _ in 0..3 {
            assert!(grant(&quotas, "a"));
        }
        assert!(grant(&quotas, "b"));
    }

    #[tokio::test]
    async fn test_extra_request_suspends_until_refill() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_second: 20.0,
            ..create_test_config()
        }));
        for _ in 0..3 {
            limiter.wait_for_slot("a").await;
        }

        let start = std::time::Instant::now();
        limiter.wait_for_slot("a").await;
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(limiter.snapshot("a").unwrap().request_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_slot() {
        let limiter = RateLimiter::new(create_test_config());
        let start = Instant::now();
        limiter.impose_cooldown("a", Duration::from_secs(30));
        assert!(limiter.cooldown_remaining("a").is_some());

        limiter.wait_for_slot("a").await;
        assert!(Instant::now() - start >= Duration::from_secs(30));
        assert!(limiter.cooldown_remaining("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_holds_for_every_caller() {
        let limiter = Arc::new(RateLimiter::new(create_test_config()));
        let start = Instant::now();
        limiter.record_failure("a", Some(Duration::from_secs(300)));

        // Two independent waiters on the same site both sit out the floor
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.wait_for_slot("a").await;
                    Instant::now()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        for waiter in waiters {
            assert!(waiter.await.unwrap() - start >= Duration::from_secs(300));
        }

        // Other sites are unaffected
        let other = Instant::now();
        limiter.wait_for_slot("b").await;
        assert_eq!(Instant::now(), other);
    }

    #[test]
    fn test_delay_adapts() {
        let limiter = RateLimiter::new(create_test_config());
        assert_eq!(limiter.next_delay("a"), Duration::from_millis(1000));

        limiter.record_failure("a", None);
        assert_eq!(limiter.next_delay("a"), Duration::from_millis(1500));

        let snapshot = limiter.snapshot("a").unwrap();
        assert_eq!(snapshot.consecutive_failures, 1);
    }
}
