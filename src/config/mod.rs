//! Configuration module for Sumi-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration
//! files, including the per-site extraction rules.
//!
//! # Example
//!
//! ```no_run
//! use sumi_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("At most {} tasks at once", config.scheduler.max_concurrent_tasks);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    AntiDetectionConfig, Config, CrawlerConfig, ProxyEntry, ProxyPoolConfig, ProxyProtocol,
    RateLimitConfig, RetryConfig, SchedulerConfig, SiteConfig,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::{validate, validate_site};
