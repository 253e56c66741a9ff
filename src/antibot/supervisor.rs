//! Anti-detection supervisor
//!
//! Composes the rate limiter, the proxy rotator and signature detection into
//! a per-site escalation ladder. Workers call `prepare` before every request
//! and `record_outcome` after it.
//!
//! # Escalation ladder
//!
//! First match wins, evaluated per outcome:
//!
//! | Signal | Cooldown | Proxy switch | Item retried |
//! |--------|----------|--------------|--------------|
//! | Captcha | captcha cooldown (>= 30s) | flagged | no |
//! | IP ban | ip-ban cooldown (>= 60s) | forced | after cooldown |
//! | Rate limit / block | block cooldown (>= 120s) | after 2 in a row | per retry policy |
//! | Other failures | none | after 3 in a row | per retry policy |

use super::{ProxyHealthReport, ProxyRotator, RateLimiter};
use crate::config::{AntiDetectionConfig, ProxyEntry};
use crate::failure::ErrorKind;
use crate::state::RateLimitState;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_USER_AGENT: &str = concat!("sumi-harvest/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Everything a worker needs to issue one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProfile {
    pub headers: BTreeMap<String, String>,

    /// Proxy to route through; None means a direct connection
    pub proxy: Option<ProxyEntry>,

    /// Pacing delay to observe before issuing the request
    pub delay: Duration,
}

/// Result of one request, as reported back by a worker
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub success: bool,
    pub response_time: Duration,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,

    /// Classified failure kind; None on success
    pub error_kind: Option<ErrorKind>,

    /// Key of the proxy the request went through
    pub proxy_key: Option<String>,
}

impl Outcome {
    pub fn success(response_time: Duration, proxy_key: Option<String>) -> Self {
        Self {
            success: true,
            response_time,
            status_code: Some(200),
            proxy_key,
            ..Self::default()
        }
    }
}

/// What the supervisor decided after an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Nothing to do
    None,

    /// Captcha: skip the item, cool down, switch proxy on the next request
    SkipItem { cooldown: Duration },

    /// IP ban or block: the site is cooling down
    Cooldown { duration: Duration, switch_proxy: bool },

    /// Too many consecutive failures on the current proxy
    SwitchProxy,
}

#[derive(Debug, Default)]
struct SiteGuard {
    consecutive_failures: u32,
    consecutive_blocks: u32,
    active_proxy: Option<ProxyEntry>,
    switch_pending: bool,
}

/// Point-in-time view of one site's anti-detection state
#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    pub rate: Option<RateLimitState>,
    pub cooldown_remaining: Option<Duration>,
    pub active_proxy: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_blocks: u32,
}

/// Per-site throttling, proxy choice and escalation
#[derive(Debug)]
pub struct AntiDetectionSupervisor {
    config: AntiDetectionConfig,
    limiter: Arc<RateLimiter>,
    rotator: Arc<ProxyRotator>,
    guards: Mutex<HashMap<String, SiteGuard>>,
}

impl AntiDetectionSupervisor {
    pub fn new(
        config: AntiDetectionConfig,
        limiter: Arc<RateLimiter>,
        rotator: Arc<ProxyRotator>,
    ) -> Self {
        Self {
            config,
            limiter,
            rotator,
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for a request slot on `site` and builds its request profile
    ///
    /// This suspends until the rate limiter grants a token, which includes
    /// sitting out any cooldown imposed on the site.
    ///
    /// # Returns
    ///
    /// * `Some(RequestProfile)` - The caller may issue its request
    /// * `None` - `cancel` fired while waiting
    pub async fn prepare(&self, site: &str, cancel: &CancellationToken) -> Option<RequestProfile> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = self.limiter.wait_for_slot(site) => {}
        }

        let proxy = self.choose_proxy(site);
        let delay = self.limiter.next_delay(site);
        let headers = self.build_headers();

        Some(RequestProfile {
            headers,
            proxy,
            delay,
        })
    }

    /// Keeps the site on its current proxy unless a switch is due
    fn choose_proxy(&self, site: &str) -> Option<ProxyEntry> {
        if self.rotator.is_empty() {
            return None;
        }

        let mut guards = self.guards.lock();
        let guard = guards.entry(site.to_string()).or_default();

        let current = guard
            .active_proxy
            .as_ref()
            .filter(|p| self.rotator.is_selectable(&p.key()))
            .cloned();

        let chosen = match (current, guard.switch_pending) {
            (Some(current), false) => Some(current),
            (Some(current), true) => self.rotator.get_next_excluding(&current.key()),
            (None, _) => match guard.active_proxy.as_ref() {
                Some(previous) => self.rotator.get_next_excluding(&previous.key()),
                None => self.rotator.get_next(),
            },
        };

        if guard.switch_pending {
            tracing::debug!(
                site = %site,
                proxy = chosen.as_ref().map(|p| p.key()).unwrap_or_else(|| "direct".to_string()),
                "Switched proxy"
            );
        }
        guard.switch_pending = false;
        guard.active_proxy = chosen.clone();

        chosen
    }

    fn build_headers(&self) -> BTreeMap<String, String> {
        let user_agent = self
            .config
            .user_agents
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), user_agent);
        headers.insert("Accept".to_string(), ACCEPT.to_string());
        headers.insert("Accept-Language".to_string(), ACCEPT_LANGUAGE.to_string());
        headers
    }

    /// Feeds a request outcome into throttling and the escalation ladder
    pub fn record_outcome(&self, site: &str, outcome: &Outcome) -> EscalationAction {
        if let Some(key) = &outcome.proxy_key {
            let error = outcome.error_kind.map(|k| k.as_str());
            self.rotator
                .report_result(key, outcome.success, outcome.response_time, error);
        }

        let mut guards = self.guards.lock();
        let guard = guards.entry(site.to_string()).or_default();

        if outcome.success {
            self.limiter.record_success(site);
            guard.consecutive_failures = 0;
            guard.consecutive_blocks = 0;
            return EscalationAction::None;
        }

        self.limiter.record_failure(site, outcome.retry_after);
        guard.consecutive_failures += 1;

        let action = match outcome.error_kind {
            Some(ErrorKind::CaptchaRequired) => {
                let cooldown = Duration::from_millis(self.config.captcha_cooldown_ms);
                self.limiter.impose_cooldown(site, cooldown);
                guard.switch_pending = true;
                EscalationAction::SkipItem { cooldown }
            }
            Some(ErrorKind::IpBanned) => {
                let duration = Duration::from_millis(self.config.ip_ban_cooldown_ms);
                self.limiter.impose_cooldown(site, duration);
                guard.switch_pending = true;
                EscalationAction::Cooldown {
                    duration,
                    switch_proxy: true,
                }
            }
            Some(ErrorKind::RateLimited) | Some(ErrorKind::Blocked) => {
                let duration = Duration::from_millis(self.config.block_cooldown_ms);
                self.limiter.impose_cooldown(site, duration);
                guard.consecutive_blocks += 1;
                let switch_proxy = guard.consecutive_blocks >= self.config.block_switch_after;
                if switch_proxy {
                    guard.switch_pending = true;
                    guard.consecutive_blocks = 0;
                }
                EscalationAction::Cooldown {
                    duration,
                    switch_proxy,
                }
            }
            _ => {
                guard.consecutive_blocks = 0;
                if guard.consecutive_failures >= self.config.failure_switch_threshold {
                    guard.switch_pending = true;
                    EscalationAction::SwitchProxy
                } else {
                    EscalationAction::None
                }
            }
        };

        if guard.switch_pending {
            guard.consecutive_failures = 0;
        }

        if action != EscalationAction::None {
            tracing::warn!(
                site = %site,
                kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                action = ?action,
                "Escalating anti-detection response"
            );
        }

        action
    }

    pub fn site_snapshot(&self, site: &str) -> SiteSnapshot {
        let guards = self.guards.lock();
        let guard = guards.get(site);
        SiteSnapshot {
            rate: self.limiter.snapshot(site),
            cooldown_remaining: self.limiter.cooldown_remaining(site),
            active_proxy: guard.and_then(|g| g.active_proxy.as_ref().map(|p| p.key())),
            consecutive_failures: guard.map_or(0, |g| g.consecutive_failures),
            consecutive_blocks: guard.map_or(0, |g| g.consecutive_blocks),
        }
    }

    pub fn proxy_health(&self) -> Vec<ProxyHealthReport> {
        self.rotator.snapshot()
    }
}
