//! Output module for extraction and task reporting
//!
//! This module handles:
//! - The extraction and notification contracts
//! - Publishing task events without blocking the crawl
//! - Displaying task summaries and scheduler statistics

mod notifier;
pub mod stats;
mod traits;

pub use notifier::{spawn_notifier, EventSender, LoggingNotifier, DEFAULT_EVENT_CAPACITY};
pub use stats::{print_statistics, print_task_summary, TaskSummary};
pub use traits::{Extractor, Notifier, Page, TaskEvent};
