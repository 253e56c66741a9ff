//! Collaborator interfaces and event types
//!
//! The orchestration core turns pages into data through an `Extractor` and
//! reports what happens through a `Notifier`. Neither is allowed to gate
//! orchestration: extractor failures are classified like any other failure,
//! and notifications go through a bounded queue.

use crate::config::SiteConfig;
use crate::crawler::{StructuredResult, TaskId};
use crate::failure::CrawlError;
use crate::state::{Progress, TaskStatus};
use crate::ExtractError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A fetched page handed to the extractor
#[derive(Debug, Clone)]
pub struct Page {
    /// Final URL after redirects
    pub url: String,
    pub status_code: u16,
    pub body: String,
}

/// Turns fetched pages into candidate links and structured results
///
/// Implementations must be thread-safe; one extractor is shared by every
/// site worker.
pub trait Extractor: Send + Sync {
    /// Extracts candidate detail-page links from a listing page
    ///
    /// # Arguments
    ///
    /// * `site` - The site's extraction rules
    /// * `page` - The fetched listing page
    ///
    /// # Returns
    ///
    /// Absolute URLs in discovery order
    fn extract_links(&self, site: &SiteConfig, page: &Page) -> Result<Vec<String>, ExtractError>;

    /// Extracts one structured result from a detail page
    ///
    /// Returns `Ok(None)` when the page holds nothing worth keeping.
    fn extract_detail(
        &self,
        site: &SiteConfig,
        page: &Page,
    ) -> Result<Option<StructuredResult>, ExtractError>;
}

/// Lifecycle event published while tasks run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        task_id: TaskId,
        query: String,
        sites: Vec<String>,
    },
    TaskProgress {
        task_id: TaskId,
        site_id: String,
        progress: Progress,
        estimated_end_time: Option<DateTime<Utc>>,
    },
    TaskResult {
        task_id: TaskId,
        result: StructuredResult,
    },
    TaskError {
        task_id: TaskId,
        error: CrawlError,
    },
    TaskCompleted {
        task_id: TaskId,
        status: TaskStatus,
        progress: Progress,
        results: usize,
        errors: usize,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskResult { task_id, .. }
            | Self::TaskError { task_id, .. }
            | Self::TaskCompleted { task_id, .. } => *task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskResult { .. } => "task_result",
            Self::TaskError { .. } => "task_error",
            Self::TaskCompleted { .. } => "task_completed",
        }
    }
}

/// Receives task events
///
/// Delivery is fire-and-forget: events reach the notifier through a bounded
/// queue drained by a dedicated dispatcher task, so a slow notifier only
/// delays other notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, event: TaskEvent);
}
