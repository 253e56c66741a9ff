//! Anti-detection layer
//!
//! # Components
//!
//! - `SignatureDetector`: recognises captcha, IP-ban, rate-limit and block responses
//! - `RateLimiter`: per-site token bucket with adaptive delay and cooldowns
//! - `ProxyRotator`: health-scored round-robin proxy pool
//! - `AntiDetectionSupervisor`: composes the above into the escalation ladder

mod detection;
mod proxy;
mod rate_limiter;
mod supervisor;

pub use detection::{DetectionSignal, SignatureDetector};
pub use proxy::{ProxyHealthReport, ProxyRotator};
pub use rate_limiter::RateLimiter;
pub use supervisor::{
    AntiDetectionSupervisor, EscalationAction, Outcome, RequestProfile, SiteSnapshot,
};
