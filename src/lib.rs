//! Sumi-Harvest: a keyword search harvester for third-party sites
//!
//! This crate implements the crawl orchestration core of a multi-site search
//! harvester: a task scheduler, per-site crawl coordinators, an anti-detection
//! supervisor with rate limiting and proxy rotation, and an error
//! classification and retry engine.

pub mod antibot;
pub mod config;
pub mod crawler;
pub mod failure;
pub mod output;
pub mod state;

use thiserror::Error;

/// Main error type for Sumi-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task queue is full ({capacity} tasks already waiting)")]
    QueueFull { capacity: usize },

    #[error("Task must target at least one site")]
    NoSites,

    #[error("Search query cannot be empty")]
    EmptyQuery,
}

/// Configuration-specific errors
///
/// Every variant is fatal: a task whose sites fail validation is rejected at
/// submission, before any network activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid rule config for site '{site}': {reason}")]
    InvalidRuleConfig { site: String, reason: String },

    #[error("Site '{site}' is missing a selector for '{field}'")]
    MissingSelector { site: String, field: String },

    #[error("Site '{site}' has an invalid URL template: {template}")]
    InvalidUrlTemplate { site: String, template: String },

    #[error("Unknown site: {0}")]
    UnknownSite(String),
}

/// Errors reported by an `Extractor` while turning a page into data
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Failed to parse page: {0}")]
    Parse(String),

    #[error("Selector matched nothing: {0}")]
    SelectorMiss(String),

    #[error("Invalid markup: {0}")]
    InvalidMarkup(String),
}

/// Result type alias for Sumi-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{SubmitOptions, Task, TaskId, TaskScheduler, TaskStore};
pub use failure::{CrawlError, ErrorKind};
pub use state::{Progress, TaskStatus};
