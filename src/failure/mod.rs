//! Failure classification and retry decisions
//!
//! # Components
//!
//! - `ErrorClassifier`: maps raw fetch/extract/config failures to `CrawlError`
//! - `RetryPolicy`: per-kind retry limits and exponential backoff

mod classify;
mod retry;

pub use classify::{
    classify_config, CrawlError, ErrorCategory, ErrorClassifier, ErrorKind, NetworkFailure,
    RawFailure, Severity,
};
pub use retry::RetryPolicy;
