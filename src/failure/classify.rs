//! Error taxonomy and classification
//!
//! Raw failures coming from the fetcher, the extractor or configuration
//! checks are mapped into a closed taxonomy. Each classified error carries a
//! severity and a `recoverable` flag, and is never mutated once created.

use crate::antibot::{DetectionSignal, SignatureDetector};
use crate::config::AntiDetectionConfig;
use crate::{ConfigError, ExtractError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Closed taxonomy of crawl failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // ===== Network =====
    Network,
    Timeout,
    ConnectionRefused,
    Dns,

    // ===== Anti-bot =====
    RateLimited,
    Blocked,
    CaptchaRequired,
    IpBanned,

    // ===== Extraction =====
    ParseError,
    SelectorMiss,
    InvalidMarkup,

    // ===== Configuration =====
    InvalidRuleConfig,
    MissingSelector,
    InvalidUrlTemplate,

    // ===== Lifecycle =====
    /// Task was cancelled by the caller
    Cancelled,

    /// Anything that fits nowhere else
    Unknown,
}

/// Broad family an `ErrorKind` belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    AntiBot,
    Extraction,
    Configuration,
    Lifecycle,
    Unclassified,
}

/// How serious an error is for downstream display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network | Self::Timeout | Self::ConnectionRefused | Self::Dns => {
                ErrorCategory::Network
            }
            Self::RateLimited | Self::Blocked | Self::CaptchaRequired | Self::IpBanned => {
                ErrorCategory::AntiBot
            }
            Self::ParseError | Self::SelectorMiss | Self::InvalidMarkup => {
                ErrorCategory::Extraction
            }
            Self::InvalidRuleConfig | Self::MissingSelector | Self::InvalidUrlTemplate => {
                ErrorCategory::Configuration
            }
            Self::Cancelled => ErrorCategory::Lifecycle,
            Self::Unknown => ErrorCategory::Unclassified,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            Self::ParseError | Self::SelectorMiss | Self::InvalidMarkup => Severity::Low,
            Self::Network
            | Self::Timeout
            | Self::ConnectionRefused
            | Self::Dns
            | Self::RateLimited
            | Self::Unknown => Severity::Medium,
            Self::Blocked | Self::CaptchaRequired | Self::Cancelled => Severity::High,
            Self::IpBanned
            | Self::InvalidRuleConfig
            | Self::MissingSelector
            | Self::InvalidUrlTemplate => Severity::Critical,
        }
    }

    /// Whether an error of this kind may be recovered from at all
    ///
    /// Network failures are always transient. IP bans and configuration
    /// errors are never retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::IpBanned
                | Self::InvalidRuleConfig
                | Self::MissingSelector
                | Self::InvalidUrlTemplate
                | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network_error",
            Self::Timeout => "timeout_error",
            Self::ConnectionRefused => "connection_refused",
            Self::Dns => "dns_error",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::CaptchaRequired => "captcha_required",
            Self::IpBanned => "ip_banned",
            Self::ParseError => "parse_error",
            Self::SelectorMiss => "selector_miss",
            Self::InvalidMarkup => "invalid_markup",
            Self::InvalidRuleConfig => "invalid_rule_config",
            Self::MissingSelector => "missing_selector",
            Self::InvalidUrlTemplate => "invalid_url_template",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<DetectionSignal> for ErrorKind {
    fn from(signal: DetectionSignal) -> Self {
        match signal {
            DetectionSignal::Captcha => Self::CaptchaRequired,
            DetectionSignal::IpBan => Self::IpBanned,
            DetectionSignal::RateLimit => Self::RateLimited,
            DetectionSignal::Block => Self::Blocked,
        }
    }
}

/// A classified failure recorded against a task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlError {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
    /// Site the failure happened on; None for task-level errors
    pub site_id: Option<String>,
    /// URL being fetched, if any
    pub url: Option<String>,
    pub status_code: Option<u16>,
    /// Server-supplied Retry-After, in milliseconds
    pub retry_after_ms: Option<u64>,
    pub details: String,
}

impl CrawlError {
    /// Creates an error with the kind's default severity and recoverability
    pub fn new(kind: ErrorKind, site_id: Option<&str>, details: impl Into<String>) -> Self {
        Self {
            kind,
            category: kind.category(),
            severity: kind.default_severity(),
            recoverable: kind.is_recoverable(),
            timestamp: Utc::now(),
            site_id: site_id.map(str::to_string),
            url: None,
            status_code: None,
            retry_after_ms: None,
            details: details.into(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after_ms = retry_after.map(|d| d.as_millis() as u64);
        self
    }

    /// Task-level entry appended when a caller cancels a task
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, None, "Task cancelled by caller")
    }

    /// Task-level entry appended when a task overruns its deadline
    pub fn task_timeout(timeout: Duration) -> Self {
        let mut error = Self::new(
            ErrorKind::Timeout,
            None,
            format!("Task exceeded its deadline of {}ms", timeout.as_millis()),
        );
        error.severity = Severity::High;
        error.recoverable = false;
        error
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.site_id {
            Some(site) => write!(f, "[{}] {}: {}", site, self.kind, self.details),
            None => write!(f, "{}: {}", self.kind, self.details),
        }
    }
}

/// Sub-kind of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    Timeout,
    Connect,
    Dns,
    Other,
}

/// An unclassified failure as produced by a collaborator
#[derive(Debug, Clone)]
pub enum RawFailure {
    /// The request never produced a response
    Network { kind: NetworkFailure, message: String },

    /// The server answered, but not with a usable page
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// The extractor could not make sense of the page
    Extraction(ExtractError),
}

/// Maps raw failures into `CrawlError`s
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    detector: SignatureDetector,
}

impl ErrorClassifier {
    pub fn new(detector: SignatureDetector) -> Self {
        Self { detector }
    }

    /// Classifier using the signature lists from `config`
    pub fn for_config(config: &AntiDetectionConfig) -> Self {
        Self::new(SignatureDetector::new(config))
    }

    /// Classifies a raw failure observed on `site_id`
    pub fn classify(&self, site_id: &str, url: Option<&str>, raw: &RawFailure) -> CrawlError {
        let error = match raw {
            RawFailure::Network { kind, message } => {
                let kind = match kind {
                    NetworkFailure::Timeout => ErrorKind::Timeout,
                    NetworkFailure::Connect => ErrorKind::ConnectionRefused,
                    NetworkFailure::Dns => ErrorKind::Dns,
                    NetworkFailure::Other => ErrorKind::Network,
                };
                CrawlError::new(kind, Some(site_id), message.clone())
            }
            RawFailure::Http {
                status,
                body,
                retry_after,
            } => self
                .classify_http(site_id, *status, body, *retry_after)
                .unwrap_or_else(|| {
                    CrawlError::new(
                        ErrorKind::Unknown,
                        Some(site_id),
                        format!("Unexpected HTTP {}", status),
                    )
                    .with_status(*status)
                }),
            RawFailure::Extraction(e) => {
                let kind = match e {
                    ExtractError::Parse(_) => ErrorKind::ParseError,
                    ExtractError::SelectorMiss(_) => ErrorKind::SelectorMiss,
                    ExtractError::InvalidMarkup(_) => ErrorKind::InvalidMarkup,
                };
                CrawlError::new(kind, Some(site_id), e.to_string())
            }
        };

        match url {
            Some(url) => error.with_url(url),
            None => error,
        }
    }

    /// Classifies an HTTP response, returning None when it is a clean page
    ///
    /// Anti-bot signatures are checked on every response, including 2xx
    /// ones, since captcha walls are commonly served with status 200.
    pub fn classify_response(
        &self,
        site_id: &str,
        url: &str,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Option<CrawlError> {
        self.classify_http(site_id, status, body, retry_after)
            .map(|e| e.with_url(url))
    }

    fn classify_http(
        &self,
        site_id: &str,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Option<CrawlError> {
        if let Some(signal) = self.detector.detect(status, body) {
            let kind = ErrorKind::from(signal);
            return Some(
                CrawlError::new(
                    kind,
                    Some(site_id),
                    format!("Anti-bot response ({:?}) with HTTP {}", signal, status),
                )
                .with_status(status)
                .with_retry_after(retry_after),
            );
        }

        let kind = match status {
            200..=299 => return None,
            408 | 504 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Network,
            _ => ErrorKind::Unknown,
        };

        Some(
            CrawlError::new(kind, Some(site_id), format!("HTTP {}", status))
                .with_status(status)
                .with_retry_after(retry_after),
        )
    }
}

/// Maps a configuration error into the taxonomy
pub fn classify_config(site_id: Option<&str>, error: &ConfigError) -> CrawlError {
    let kind = match error {
        ConfigError::MissingSelector { .. } => ErrorKind::MissingSelector,
        ConfigError::InvalidUrlTemplate { .. } => ErrorKind::InvalidUrlTemplate,
        _ => ErrorKind::InvalidRuleConfig,
    };
    CrawlError::new(kind, site_id, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::default()
    }

    #[test]
    fn test_network_failures_are_recoverable() {
        for (failure, kind) in [
            (NetworkFailure::Timeout, ErrorKind::Timeout),
            (NetworkFailure::Connect, ErrorKind::ConnectionRefused),
            (NetworkFailure::Dns, ErrorKind::Dns),
            (NetworkFailure::Other, ErrorKind::Network),
        ] {
            let raw = RawFailure::Network {
                kind: failure,
                message: "boom".to_string(),
            };
            let error = classifier().classify("a", Some("https://a.example/"), &raw);
            assert_eq!(error.kind, kind);
            assert_eq!(error.category, ErrorCategory::Network);
            assert!(error.recoverable);
            assert_eq!(error.site_id.as_deref(), Some("a"));
            assert_eq!(error.url.as_deref(), Some("https://a.example/"));
        }
    }

    #[test]
    fn test_http_status_mapping() {
        let classify = |status: u16| {
            classifier().classify(
                "a",
                None,
                &RawFailure::Http {
                    status,
                    body: String::new(),
                    retry_after: None,
                },
            )
        };

        assert_eq!(classify(429).kind, ErrorKind::RateLimited);
        assert_eq!(classify(403).kind, ErrorKind::Blocked);
        assert_eq!(classify(503).kind, ErrorKind::Network);
        assert_eq!(classify(504).kind, ErrorKind::Timeout);
        assert_eq!(classify(404).kind, ErrorKind::Unknown);
        assert_eq!(classify(404).status_code, Some(404));
    }

    #[test]
    fn test_ip_ban_is_never_recoverable() {
        let error = classifier().classify(
            "a",
            None,
            &RawFailure::Http {
                status: 403,
                body: "Your IP has been blocked".to_string(),
                retry_after: None,
            },
        );
        assert_eq!(error.kind, ErrorKind::IpBanned);
        assert!(!error.recoverable);
        assert_eq!(error.severity, Severity::Critical);
    }

    #[test]
    fn test_clean_response_is_not_an_error() {
        let result = classifier().classify_response("a", "https://a/", 200, "<h1>ok</h1>", None);
        assert!(result.is_none());
    }

    #[test]
    fn test_captcha_on_success_status() {
        let result = classifier()
            .classify_response("a", "https://a/", 200, "Please verify you are HUMAN", None)
            .unwrap();
        assert_eq!(result.kind, ErrorKind::CaptchaRequired);
        assert_eq!(result.category, ErrorCategory::AntiBot);
    }

    #[test]
    fn test_page_mentioning_captcha_is_not_a_challenge() {
        let body = r#"<h1>Desk lamp</h1><p>Reviews are protected by a captcha.</p>"#;
        let result = classifier().classify_response("a", "https://a/", 200, body, None);
        assert!(result.is_none());
    }

    #[test]
    fn test_retry_after_carried() {
        let result = classifier()
            .classify_response("a", "https://a/", 429, "", Some(Duration::from_secs(7)))
            .unwrap();
        assert_eq!(result.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_extraction_errors() {
        let error = classifier().classify(
            "a",
            None,
            &RawFailure::Extraction(ExtractError::SelectorMiss("h1".to_string())),
        );
        assert_eq!(error.kind, ErrorKind::SelectorMiss);
        assert_eq!(error.category, ErrorCategory::Extraction);
        assert!(error.recoverable);
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let error = classify_config(
            Some("a"),
            &ConfigError::InvalidUrlTemplate {
                site: "a".to_string(),
                template: "x".to_string(),
            },
        );
        assert_eq!(error.kind, ErrorKind::InvalidUrlTemplate);
        assert!(!error.recoverable);
        assert_eq!(error.category, ErrorCategory::Configuration);
    }

    #[test]
    fn test_task_level_errors() {
        let cancelled = CrawlError::cancelled();
        assert_eq!(cancelled.kind, ErrorKind::Cancelled);
        assert!(!cancelled.recoverable);
        assert!(cancelled.site_id.is_none());

        let timeout = CrawlError::task_timeout(Duration::from_secs(5));
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert!(!timeout.recoverable);
        assert!(timeout.details.contains("5000ms"));
    }
}
