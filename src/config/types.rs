use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for Sumi-Harvest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default, rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default, rename = "anti-detection")]
    pub anti_detection: AntiDetectionConfig,
    #[serde(default, rename = "proxy-pool")]
    pub proxy_pool: ProxyPoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyEntry>,
    #[serde(default, rename = "site")]
    pub sites: Vec<SiteConfig>,
}

impl Config {
    /// Looks up a site rule by its identifier
    pub fn site(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == id)
    }
}

/// Task admission and lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at the same time
    #[serde(rename = "max-concurrent-tasks", default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Maximum number of tasks waiting for a slot
    #[serde(rename = "max-queue-size", default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Deadline for a whole task once admitted (milliseconds)
    #[serde(rename = "task-timeout-ms", default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// How long archived tasks are kept before the janitor purges them
    #[serde(rename = "archive-retention-hours", default = "default_retention_hours")]
    pub archive_retention_hours: u64,

    /// Result cap applied when a submission does not set one
    #[serde(rename = "default-max-results", default = "default_max_results")]
    pub default_max_results: usize,

    /// Attempts per network step when a submission does not set one
    #[serde(rename = "default-retry-attempts", default = "default_retry_attempts")]
    pub default_retry_attempts: u32,
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_queue_size: default_max_queue_size(),
            task_timeout_ms: default_task_timeout_ms(),
            archive_retention_hours: default_retention_hours(),
            default_max_results: default_max_results(),
            default_retry_attempts: default_retry_attempts(),
        }
    }
}

/// HTTP behavior of the per-site crawl
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Upper bound on detail links followed per site
    #[serde(rename = "max-detail-links", default = "default_max_detail_links")]
    pub max_detail_links: usize,

    /// Whole-request timeout (milliseconds)
    #[serde(rename = "request-timeout-ms", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connection establishment timeout (milliseconds)
    #[serde(rename = "connect-timeout-ms", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_detail_links: default_max_detail_links(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Per-site token bucket and adaptive delay settings
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(rename = "requests-per-second", default = "default_rps")]
    pub requests_per_second: f64,

    #[serde(rename = "requests-per-minute", default = "default_rpm")]
    pub requests_per_minute: u32,

    #[serde(rename = "requests-per-hour", default = "default_rph")]
    pub requests_per_hour: u32,

    /// Bucket capacity
    #[serde(rename = "burst-size", default = "default_burst_size")]
    pub burst_size: u32,

    /// Baseline delay between consecutive requests to a site (milliseconds)
    #[serde(rename = "base-delay-ms", default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for the adaptive delay (milliseconds)
    #[serde(rename = "max-delay-ms", default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after each failure
    #[serde(rename = "growth-factor", default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Consecutive successes needed before the delay decays
    #[serde(rename = "success-decay-threshold", default = "default_decay_threshold")]
    pub success_decay_threshold: u32,

    /// Treat a server-supplied Retry-After as a floor for the next delay
    #[serde(rename = "respect-retry-after", default = "default_true")]
    pub respect_retry_after: bool,
}

impl RateLimitConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            requests_per_minute: default_rpm(),
            requests_per_hour: default_rph(),
            burst_size: default_burst_size(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            growth_factor: default_growth_factor(),
            success_decay_threshold: default_decay_threshold(),
            respect_retry_after: true,
        }
    }
}

/// Escalation ladder thresholds and detection signatures
#[derive(Debug, Clone, Deserialize)]
pub struct AntiDetectionConfig {
    /// Consecutive ordinary failures before the site's proxy is switched
    #[serde(rename = "failure-switch-threshold", default = "default_failure_switch")]
    pub failure_switch_threshold: u32,

    #[serde(rename = "captcha-cooldown-ms", default = "default_captcha_cooldown_ms")]
    pub captcha_cooldown_ms: u64,

    #[serde(rename = "ip-ban-cooldown-ms", default = "default_ip_ban_cooldown_ms")]
    pub ip_ban_cooldown_ms: u64,

    #[serde(rename = "block-cooldown-ms", default = "default_block_cooldown_ms")]
    pub block_cooldown_ms: u64,

    /// Consecutive generic blocks before the proxy is switched
    #[serde(rename = "block-switch-after", default = "default_block_switch_after")]
    pub block_switch_after: u32,

    #[serde(rename = "user-agents", default = "default_user_agents")]
    pub user_agents: Vec<String>,

    #[serde(rename = "captcha-signatures", default = "default_captcha_signatures")]
    pub captcha_signatures: Vec<String>,

    #[serde(rename = "ip-ban-signatures", default = "default_ip_ban_signatures")]
    pub ip_ban_signatures: Vec<String>,

    #[serde(rename = "block-signatures", default = "default_block_signatures")]
    pub block_signatures: Vec<String>,
}

impl Default for AntiDetectionConfig {
    fn default() -> Self {
        Self {
            failure_switch_threshold: default_failure_switch(),
            captcha_cooldown_ms: default_captcha_cooldown_ms(),
            ip_ban_cooldown_ms: default_ip_ban_cooldown_ms(),
            block_cooldown_ms: default_block_cooldown_ms(),
            block_switch_after: default_block_switch_after(),
            user_agents: default_user_agents(),
            captcha_signatures: default_captcha_signatures(),
            ip_ban_signatures: default_ip_ban_signatures(),
            block_signatures: default_block_signatures(),
        }
    }
}

/// Proxy health scoring and cooldown settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyPoolConfig {
    /// Minimum health score for a proxy to be selected
    #[serde(rename = "health-threshold", default = "default_health_threshold")]
    pub health_threshold: f64,

    /// Consecutive failures that put a proxy into cooldown
    #[serde(rename = "failure-cooldown-threshold", default = "default_failure_switch")]
    pub failure_cooldown_threshold: u32,

    #[serde(rename = "cooldown-ms", default = "default_ip_ban_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Weight of the newest outcome in the health moving average
    #[serde(rename = "ema-alpha", default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            health_threshold: default_health_threshold(),
            failure_cooldown_threshold: default_failure_switch(),
            cooldown_ms: default_ip_ban_cooldown_ms(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

/// Exponential backoff settings for retried network steps
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(rename = "base-delay-ms", default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(rename = "max-delay-ms", default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Outbound proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

/// A single outbound proxy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyEntry {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyEntry {
    /// Stable key identifying this proxy, e.g. `http://10.0.0.1:8080`
    pub fn key(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// Extraction rules for one target site
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Identifier used in submissions
    pub id: String,

    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Search page template; `{query}` is replaced by the encoded query
    #[serde(rename = "search-url")]
    pub search_url: String,

    /// Selector locating detail links on the search page
    #[serde(rename = "link-selector")]
    pub link_selector: String,

    /// Field name -> selector for detail pages
    #[serde(default)]
    pub fields: BTreeMap<String, String>,

    /// Per-site override of `crawler.max-detail-links`
    #[serde(rename = "max-detail-links", default)]
    pub max_detail_links: Option<usize>,
}

impl SiteConfig {
    /// Expands the search template for a query
    pub fn search_url_for(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.search_url.replace("{query}", &encoded)
    }
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_queue_size() -> usize {
    50
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_retention_hours() -> u64 {
    24
}

fn default_max_results() -> usize {
    100
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_max_detail_links() -> usize {
    20
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_rps() -> f64 {
    1.0
}

fn default_rpm() -> u32 {
    30
}

fn default_rph() -> u32 {
    600
}

fn default_burst_size() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_growth_factor() -> f64 {
    1.5
}

fn default_decay_threshold() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_failure_switch() -> u32 {
    3
}

fn default_captcha_cooldown_ms() -> u64 {
    30_000
}

fn default_ip_ban_cooldown_ms() -> u64 {
    60_000
}

fn default_block_cooldown_ms() -> u64 {
    120_000
}

fn default_block_switch_after() -> u32 {
    2
}

fn default_health_threshold() -> f64 {
    40.0
}

fn default_ema_alpha() -> f64 {
    0.3
}

fn default_protocol() -> ProxyProtocol {
    ProxyProtocol::Http
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_captcha_signatures() -> Vec<String> {
    [
        "g-recaptcha",
        "h-captcha",
        "cf-challenge",
        "verify you are human",
        "are you a robot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ip_ban_signatures() -> Vec<String> {
    [
        "your ip has been blocked",
        "your ip address has been banned",
        "ip banned",
        "access denied for your ip",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_block_signatures() -> Vec<String> {
    [
        "access denied",
        "unusual traffic",
        "too many requests",
        "request blocked",
        "automated queries",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
