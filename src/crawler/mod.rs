//! Crawler module for task scheduling and site crawling
//!
//! This module contains the core crawling logic, including:
//! - Task model and the in-memory task registry
//! - The task scheduler (admission, deadlines, pause/cancel)
//! - Per-site crawl coordination with retries
//! - HTTP fetching and selector-based extraction

mod coordinator;
mod fetcher;
mod parser;
mod registry;
mod scheduler;
mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{CrawlContext, SiteCrawlCoordinator, TaskSignals};
pub use fetcher::{build_http_client, parse_retry_after, FetchResult, HttpFetcher, PageFetcher};
pub use parser::HtmlExtractor;
pub use registry::{SchedulerStats, SiteFinish, TaskStore};
pub use scheduler::TaskScheduler;
pub use task::{Priority, StructuredResult, SubmitOptions, Task, TaskId, TaskOptions};
