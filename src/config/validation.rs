use crate::config::types::{
    AntiDetectionConfig, Config, CrawlerConfig, ProxyEntry, ProxyPoolConfig, RateLimitConfig,
    SchedulerConfig, SiteConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Placeholder substituted with the encoded query in `search-url`
const QUERY_PLACEHOLDER: &str = "{query}";

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_crawler_config(&config.crawler)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_anti_detection_config(&config.anti_detection)?;
    validate_proxy_pool_config(&config.proxy_pool)?;

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry max_delay_ms ({}) must be >= base_delay_ms ({})",
            config.retry.max_delay_ms, config.retry.base_delay_ms
        )));
    }

    for proxy in &config.proxies {
        validate_proxy(proxy)?;
    }

    let mut seen = HashSet::new();
    for site in &config.sites {
        if !seen.insert(site.id.as_str()) {
            return Err(ConfigError::InvalidRuleConfig {
                site: site.id.clone(),
                reason: "duplicate site id".to_string(),
            });
        }
        validate_site(site)?;
    }

    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_tasks < 1 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_tasks must be >= 1, got {}",
            config.max_concurrent_tasks
        )));
    }

    if config.task_timeout_ms < 1000 {
        return Err(ConfigError::Validation(format!(
            "task_timeout_ms must be >= 1000ms, got {}ms",
            config.task_timeout_ms
        )));
    }

    if config.default_max_results < 1 {
        return Err(ConfigError::Validation(
            "default_max_results must be >= 1".to_string(),
        ));
    }

    if config.default_retry_attempts < 1 {
        return Err(ConfigError::Validation(
            "default_retry_attempts must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_detail_links < 1 {
        return Err(ConfigError::Validation(
            "max_detail_links must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_ms < 100 || config.connect_timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "request and connect timeouts must be >= 100ms, got {}ms / {}ms",
            config.request_timeout_ms, config.connect_timeout_ms
        )));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if !(config.requests_per_second > 0.0) {
        return Err(ConfigError::Validation(format!(
            "requests_per_second must be > 0, got {}",
            config.requests_per_second
        )));
    }

    if config.requests_per_minute < 1 || config.requests_per_hour < 1 {
        return Err(ConfigError::Validation(
            "requests_per_minute and requests_per_hour must be >= 1".to_string(),
        ));
    }

    if config.burst_size < 1 {
        return Err(ConfigError::Validation(
            "burst_size must be >= 1".to_string(),
        ));
    }

    if config.growth_factor <= 1.0 {
        return Err(ConfigError::Validation(format!(
            "growth_factor must be > 1.0, got {}",
            config.growth_factor
        )));
    }

    if config.max_delay_ms < config.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "rate-limit max_delay_ms ({}) must be >= base_delay_ms ({})",
            config.max_delay_ms, config.base_delay_ms
        )));
    }

    if config.success_decay_threshold < 1 {
        return Err(ConfigError::Validation(
            "success_decay_threshold must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_anti_detection_config(config: &AntiDetectionConfig) -> Result<(), ConfigError> {
    if config.failure_switch_threshold < 1 || config.block_switch_after < 1 {
        return Err(ConfigError::Validation(
            "failure_switch_threshold and block_switch_after must be >= 1".to_string(),
        ));
    }

    // The escalation ladder guarantees minimum cooldowns
    if config.captcha_cooldown_ms < 30_000 {
        return Err(ConfigError::Validation(format!(
            "captcha_cooldown_ms must be >= 30000ms, got {}ms",
            config.captcha_cooldown_ms
        )));
    }
    if config.ip_ban_cooldown_ms < 60_000 {
        return Err(ConfigError::Validation(format!(
            "ip_ban_cooldown_ms must be >= 60000ms, got {}ms",
            config.ip_ban_cooldown_ms
        )));
    }
    if config.block_cooldown_ms < 120_000 {
        return Err(ConfigError::Validation(format!(
            "block_cooldown_ms must be >= 120000ms, got {}ms",
            config.block_cooldown_ms
        )));
    }

    if config.user_agents.iter().any(|ua| ua.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "user_agents cannot contain empty entries".to_string(),
        ));
    }

    Ok(())
}

fn validate_proxy_pool_config(config: &ProxyPoolConfig) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&config.health_threshold) {
        return Err(ConfigError::Validation(format!(
            "health_threshold must be within 0..=100, got {}",
            config.health_threshold
        )));
    }

    if !(config.ema_alpha > 0.0 && config.ema_alpha <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "ema_alpha must be within (0, 1], got {}",
            config.ema_alpha
        )));
    }

    if config.failure_cooldown_threshold < 1 {
        return Err(ConfigError::Validation(
            "failure_cooldown_threshold must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_proxy(proxy: &ProxyEntry) -> Result<(), ConfigError> {
    if proxy.host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "proxy host cannot be empty".to_string(),
        ));
    }

    if proxy.port == 0 {
        return Err(ConfigError::Validation(format!(
            "proxy {} has port 0",
            proxy.host
        )));
    }

    if proxy.password.is_some() && proxy.username.is_none() {
        return Err(ConfigError::Validation(format!(
            "proxy {} has a password but no username",
            proxy.key()
        )));
    }

    Url::parse(&proxy.key())
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy '{}': {}", proxy.key(), e)))?;

    Ok(())
}

/// Validates a single site rule
///
/// Called for every site at load time and again for each targeted site when
/// a task is submitted, so malformed rules never reach the network.
pub fn validate_site(site: &SiteConfig) -> Result<(), ConfigError> {
    if site.id.trim().is_empty() {
        return Err(ConfigError::InvalidRuleConfig {
            site: site.id.clone(),
            reason: "site id cannot be empty".to_string(),
        });
    }

    validate_url_template(site)?;

    if site.link_selector.trim().is_empty() {
        return Err(ConfigError::MissingSelector {
            site: site.id.clone(),
            field: "link-selector".to_string(),
        });
    }

    if site.fields.is_empty() {
        return Err(ConfigError::MissingSelector {
            site: site.id.clone(),
            field: "fields".to_string(),
        });
    }

    for (field, selector) in &site.fields {
        if field.trim().is_empty() {
            return Err(ConfigError::InvalidRuleConfig {
                site: site.id.clone(),
                reason: "field names cannot be empty".to_string(),
            });
        }
        if selector.trim().is_empty() {
            return Err(ConfigError::MissingSelector {
                site: site.id.clone(),
                field: field.clone(),
            });
        }
    }

    if site.max_detail_links == Some(0) {
        return Err(ConfigError::InvalidRuleConfig {
            site: site.id.clone(),
            reason: "max-detail-links must be >= 1".to_string(),
        });
    }

    Ok(())
}

/// Validates the search URL template of a site
fn validate_url_template(site: &SiteConfig) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUrlTemplate {
        site: site.id.clone(),
        template: site.search_url.clone(),
    };

    if !site.search_url.contains(QUERY_PLACEHOLDER) {
        return Err(invalid());
    }

    let expanded = site.search_url_for("sample");
    let url = Url::parse(&expanded).map_err(|_| invalid())?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid());
    }

    if url.host_str().is_none() {
        return Err(invalid());
    }

    Ok(())
}
