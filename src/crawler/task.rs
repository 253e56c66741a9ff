//! Task records and submission options

use crate::config::SchedulerConfig;
use crate::failure::CrawlError;
use crate::state::{Progress, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of a search task
pub type TaskId = Uuid;

/// Caller-assigned importance of a task
///
/// Recorded on the task and reported in events; admission is FIFO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Options supplied with `submit`; unset fields take the scheduler defaults
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub max_results: Option<usize>,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub retry_attempts: Option<u32>,
}

impl SubmitOptions {
    pub fn resolve(&self, defaults: &SchedulerConfig) -> TaskOptions {
        TaskOptions {
            max_results: self.max_results.unwrap_or(defaults.default_max_results),
            priority: self.priority,
            timeout_ms: self
                .timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(defaults.task_timeout_ms),
            retry_attempts: self
                .retry_attempts
                .unwrap_or(defaults.default_retry_attempts)
                .max(1),
        }
    }
}

/// Options as fixed on the task at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskOptions {
    pub max_results: usize,
    pub priority: Priority,
    pub timeout_ms: u64,
    /// Attempts per network step, including the first
    pub retry_attempts: u32,
}

impl TaskOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One extracted item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredResult {
    pub site_id: String,
    pub url: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub extracted_at: DateTime<Utc>,
}

impl StructuredResult {
    pub fn new(
        site_id: impl Into<String>,
        url: impl Into<String>,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            url: url.into(),
            fields,
            extracted_at: Utc::now(),
        }
    }
}

/// A search spanning several sites
///
/// Snapshots handed out by the scheduler are copies; mutating one has no
/// effect on the task being crawled.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub query: String,
    pub site_ids: Vec<String>,
    pub status: TaskStatus,
    pub progress: Progress,
    pub options: TaskOptions,
    pub submitted_at: DateTime<Utc>,
    /// When the task was admitted and began crawling
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_end_time: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: Vec<StructuredResult>,
    pub errors: Vec<CrawlError>,
}

impl Task {
    pub fn new(query: String, site_ids: Vec<String>, options: TaskOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            progress: Progress::new(site_ids.len() as u32),
            site_ids,
            status: TaskStatus::Pending,
            options,
            submitted_at: Utc::now(),
            started_at: None,
            estimated_end_time: None,
            ended_at: None,
            results: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Whether the task already holds `max_results` results
    pub fn is_full(&self) -> bool {
        self.results.len() >= self.options.max_results
    }

    /// Wall time from admission to the end of the task
    pub fn completion_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Extrapolates the end time from the sites finished so far
    pub fn update_estimate(&mut self, now: DateTime<Utc>) {
        let finished = self.progress.finished();
        let Some(started) = self.started_at else {
            return;
        };
        if finished == 0 || self.progress.is_done() {
            self.estimated_end_time = None;
            return;
        }

        let per_site = (now - started) / finished as i32;
        self.estimated_end_time = Some(now + per_site * self.progress.remaining() as i32);
    }
}
