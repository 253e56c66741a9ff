//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients, one per outbound proxy
//! - Applying the per-request headers chosen by the supervisor
//! - Parsing `Retry-After`
//! - Sorting transport failures into timeout / connect / DNS / other

use crate::antibot::RequestProfile;
use crate::config::{CrawlerConfig, ProxyEntry};
use crate::failure::NetworkFailure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{header::RETRY_AFTER, Client, Proxy};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

/// Client cache key for requests without a proxy
const DIRECT: &str = "direct";

/// Result of a fetch operation
#[derive(Debug, Clone)]
pub enum FetchResult {
    /// The server answered with a 2xx status
    Success {
        /// Final URL after redirects
        final_url: String,
        /// HTTP status code
        status_code: u16,
        /// Page body content
        body: String,
    },

    /// The server answered with a non-2xx status
    HttpError {
        /// The HTTP status code
        status_code: u16,
        /// Response body, kept for block detection
        body: String,
        /// Server-supplied Retry-After
        retry_after: Option<Duration>,
    },

    /// No response (connection refused, timeout, DNS, ...)
    NetworkError {
        kind: NetworkFailure,
        /// Error description
        error: String,
    },
}

/// Fetches pages on behalf of site workers
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Issues one GET request shaped by `profile`
    async fn fetch(&self, url: &str, profile: &RequestProfile) -> FetchResult;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - Timeouts to apply
/// * `proxy` - Outbound proxy to route every request through, if any
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client or proxy
pub fn build_http_client(
    config: &CrawlerConfig,
    proxy: Option<&ProxyEntry>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .gzip(true)
        .brotli(true);

    if let Some(entry) = proxy {
        let mut proxy = Proxy::all(entry.key())?;
        if let Some(username) = &entry.username {
            proxy = proxy.basic_auth(username, entry.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }

    builder.build()
}

/// reqwest-backed `PageFetcher`
///
/// Keeps one client per proxy so connection pools are not shared across
/// outbound identities.
#[derive(Debug)]
pub struct HttpFetcher {
    config: CrawlerConfig,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&ProxyEntry>) -> Result<Client, reqwest::Error> {
        let key = proxy.map_or_else(|| DIRECT.to_string(), |p| p.key());
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_http_client(&self.config, proxy)?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, profile: &RequestProfile) -> FetchResult {
        let client = match self.client_for(profile.proxy.as_ref()) {
            Ok(client) => client,
            Err(e) => {
                return FetchResult::NetworkError {
                    kind: NetworkFailure::Other,
                    error: format!("Failed to build HTTP client: {}", e),
                }
            }
        };

        let mut request = client.get(url);
        for (name, value) in &profile.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return network_error(&e),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return network_error(&e),
        };

        if status.is_success() {
            FetchResult::Success {
                final_url,
                status_code: status.as_u16(),
                body,
            }
        } else {
            FetchResult::HttpError {
                status_code: status.as_u16(),
                body,
                retry_after,
            }
        }
    }
}

/// Classifies a transport-level reqwest error
fn network_error(error: &reqwest::Error) -> FetchResult {
    let kind = if error.is_timeout() {
        NetworkFailure::Timeout
    } else if chain_mentions(error, "dns") || chain_mentions(error, "failed to lookup") {
        NetworkFailure::Dns
    } else if error.is_connect() {
        NetworkFailure::Connect
    } else {
        NetworkFailure::Other
    };

    FetchResult::NetworkError {
        kind,
        error: error.to_string(),
    }
}

fn chain_mentions(error: &(dyn StdError + 'static), needle: &str) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.to_string().to_lowercase().contains(needle) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Parses a `Retry-After` value, either delta-seconds or an HTTP-date
///
/// Dates in the past yield a zero duration.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
