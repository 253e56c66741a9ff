//! Outbound proxy pool with health scoring and rotation
//!
//! Health is an exponential moving average of request outcomes (100 for a
//! success, 0 for a failure). Proxies at or below the health threshold, or
//! after repeated consecutive failures, sit out a cooldown and then come back
//! on probation.

use crate::config::{ProxyEntry, ProxyPoolConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

const MAX_HEALTH: f64 = 100.0;

/// Probation score is this far above the threshold
const PROBATION_MARGIN: f64 = 10.0;

#[derive(Debug, Clone)]
struct ProxyState {
    entry: ProxyEntry,
    key: String,
    health_score: f64,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    avg_response_ms: f64,
    cooldown_until: Option<Instant>,
}

impl ProxyState {
    fn new(entry: ProxyEntry) -> Self {
        Self {
            key: entry.key(),
            entry,
            health_score: MAX_HEALTH,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_ms: 0.0,
            cooldown_until: None,
        }
    }

    /// Brings an expired cooldown back on probation
    fn settle_cooldown(&mut self, config: &ProxyPoolConfig, now: Instant) {
        if let Some(until) = self.cooldown_until {
            if until <= now {
                self.cooldown_until = None;
                self.consecutive_failures = 0;
                self.health_score = (config.health_threshold + PROBATION_MARGIN).min(MAX_HEALTH);
                tracing::debug!(proxy = %self.key, "Proxy back on probation");
            }
        }
    }

    fn is_available(&self, config: &ProxyPoolConfig, now: Instant) -> bool {
        self.health_score > config.health_threshold
            && self.cooldown_until.map_or(true, |until| until <= now)
    }
}

/// Point-in-time view of a proxy's health
#[derive(Debug, Clone, Serialize)]
pub struct ProxyHealthReport {
    pub proxy: String,
    pub health_score: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_ms: f64,
    pub cooling_down: bool,
}

#[derive(Debug)]
struct Pool {
    proxies: Vec<ProxyState>,
    cursor: usize,
}

/// Round-robin proxy selection over healthy proxies
#[derive(Debug)]
pub struct ProxyRotator {
    config: ProxyPoolConfig,
    pool: Mutex<Pool>,
}

impl ProxyRotator {
    pub fn new(proxies: Vec<ProxyEntry>, config: ProxyPoolConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(Pool {
                proxies: proxies.into_iter().map(ProxyState::new).collect(),
                cursor: 0,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().proxies.is_empty()
    }

    /// Returns the next healthy proxy in round-robin order
    ///
    /// Returns None when the pool is empty or every proxy is unhealthy or
    /// cooling down.
    pub fn get_next(&self) -> Option<ProxyEntry> {
        self.select(None)
    }

    /// Like `get_next`, but never returns the proxy with key `exclude` when
    /// another one is available
    pub fn get_next_excluding(&self, exclude: &str) -> Option<ProxyEntry> {
        self.select(Some(exclude)).or_else(|| {
            // Nothing else is healthy; fall back to the excluded one if it is
            self.select(None)
        })
    }

    fn select(&self, exclude: Option<&str>) -> Option<ProxyEntry> {
        let now = Instant::now();
        let mut pool = self.pool.lock();
        let len = pool.proxies.len();
        if len == 0 {
            return None;
        }

        for offset in 0..len {
            let index = (pool.cursor + offset) % len;
            let proxy = &mut pool.proxies[index];
            proxy.settle_cooldown(&self.config, now);

            if exclude == Some(proxy.key.as_str()) || !proxy.is_available(&self.config, now) {
                continue;
            }

            let entry = proxy.entry.clone();
            pool.cursor = (index + 1) % len;
            return Some(entry);
        }

        None
    }

    /// Checks whether the proxy with `proxy_key` could be selected right now
    pub fn is_selectable(&self, proxy_key: &str) -> bool {
        let now = Instant::now();
        let mut pool = self.pool.lock();
        match pool.proxies.iter_mut().find(|p| p.key == proxy_key) {
            Some(proxy) => {
                proxy.settle_cooldown(&self.config, now);
                proxy.is_available(&self.config, now)
            }
            None => false,
        }
    }

    /// Records the outcome of a request made through `proxy_key`
    ///
    /// # Arguments
    ///
    /// * `proxy_key` - The proxy's `scheme://host:port` key
    /// * `success` - Whether the request succeeded
    /// * `response_time` - How long the request took
    /// * `error` - Failure description, if any
    pub fn report_result(
        &self,
        proxy_key: &str,
        success: bool,
        response_time: Duration,
        error: Option<&str>,
    ) {
        let now = Instant::now();
        let mut pool = self.pool.lock();
        let Some(proxy) = pool.proxies.iter_mut().find(|p| p.key == proxy_key) else {
            tracing::warn!(proxy = %proxy_key, "Result reported for unknown proxy");
            return;
        };

        let outcome = if success { MAX_HEALTH } else { 0.0 };
        let alpha = self.config.ema_alpha;
        proxy.health_score = alpha * outcome + (1.0 - alpha) * proxy.health_score;

        let samples = (proxy.success_count + proxy.failure_count + 1) as f64;
        let response_ms = response_time.as_secs_f64() * 1000.0;
        proxy.avg_response_ms += (response_ms - proxy.avg_response_ms) / samples;

        if success {
            proxy.success_count += 1;
            proxy.consecutive_failures = 0;
            return;
        }

        proxy.failure_count += 1;
        proxy.consecutive_failures += 1;

        let exhausted = proxy.consecutive_failures >= self.config.failure_cooldown_threshold;
        let unhealthy = proxy.health_score <= self.config.health_threshold;
        if (exhausted || unhealthy) && proxy.cooldown_until.map_or(true, |u| u <= now) {
            proxy.cooldown_until = Some(now + Duration::from_millis(self.config.cooldown_ms));
            tracing::warn!(
                proxy = %proxy.key,
                health = proxy.health_score,
                consecutive_failures = proxy.consecutive_failures,
                error = error.unwrap_or("unknown"),
                "Proxy entering cooldown"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<ProxyHealthReport> {
        let now = Instant::now();
        self.pool
            .lock()
            .proxies
            .iter()
            .map(|p| ProxyHealthReport {
                proxy: p.key.clone(),
                health_score: p.health_score,
                success_count: p.success_count,
                failure_count: p.failure_count,
                avg_response_ms: p.avg_response_ms,
                cooling_down: p.cooldown_until.is_some_and(|u| u > now),
            })
            .collect()
    }
}
