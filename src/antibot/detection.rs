//! Block and captcha detection
//!
//! Responses are matched against configurable signature lists. The first
//! matching category in escalation order wins: captcha, IP ban, rate limit,
//! generic block.

use crate::config::AntiDetectionConfig;
use serde::Serialize;

/// Anti-bot signal recognised in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSignal {
    Captcha,
    IpBan,
    RateLimit,
    Block,
}

/// Matches response status and content against signature lists
#[derive(Debug, Clone)]
pub struct SignatureDetector {
    captcha: Vec<String>,
    ip_ban: Vec<String>,
    block: Vec<String>,
}

impl SignatureDetector {
    pub fn new(config: &AntiDetectionConfig) -> Self {
        Self {
            captcha: lowercase_all(&config.captcha_signatures),
            ip_ban: lowercase_all(&config.ip_ban_signatures),
            block: lowercase_all(&config.block_signatures),
        }
    }

    /// Classifies a response, returning None for a clean one
    ///
    /// # Arguments
    ///
    /// * `status` - HTTP status code
    /// * `body` - Response body (may be empty)
    pub fn detect(&self, status: u16, body: &str) -> Option<DetectionSignal> {
        let content = body.to_lowercase();

        if contains_any(&content, &self.captcha) {
            return Some(DetectionSignal::Captcha);
        }

        if contains_any(&content, &self.ip_ban) {
            return Some(DetectionSignal::IpBan);
        }

        if status == 429 {
            return Some(DetectionSignal::RateLimit);
        }

        if status == 403 || contains_any(&content, &self.block) {
            return Some(DetectionSignal::Block);
        }

        None
    }
}

impl Default for SignatureDetector {
    fn default() -> Self {
        Self::new(&AntiDetectionConfig::default())
    }
}

fn lowercase_all(signatures: &[String]) -> Vec<String> {
    signatures
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn contains_any(content: &str, signatures: &[String]) -> bool {
    signatures.iter().any(|sig| content.contains(sig.as_str()))
}
