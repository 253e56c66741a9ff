//! Task scheduler
//!
//! This module handles:
//! - Validating and queueing submitted tasks
//! - FIFO admission bounded by `max-concurrent-tasks`
//! - Fanning each admitted task out to one coordinator per site
//! - Pause, resume, cancellation and the per-task deadline
//! - Archive statistics and retention
//!
//! Every admitted task gets a driver task that owns its site workers and
//! races them against the task's deadline and cancellation token. A slot is
//! released by the registry the moment its task turns terminal; queued tasks
//! are admitted on submission, on cancel or timeout, and when a driver exits.

use super::coordinator::{CrawlContext, SiteCrawlCoordinator, TaskSignals};
use super::fetcher::PageFetcher;
use super::registry::{SchedulerStats, TaskStore};
use super::task::{SubmitOptions, Task, TaskId, TaskOptions};
use crate::antibot::{ProxyHealthReport, SiteSnapshot};
use crate::config::{self, Config, SiteConfig};
use crate::failure::{classify_config, CrawlError};
use crate::output::{EventSender, Extractor, TaskEvent};
use crate::state::TaskStatus;
use crate::{ConfigError, HarvestError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Control handles of a task holding a slot
struct TaskControl {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

struct SchedulerInner {
    config: Config,
    sites: HashMap<String, Arc<SiteConfig>>,
    ctx: Arc<CrawlContext>,
    controls: Mutex<HashMap<TaskId, TaskControl>>,
    /// Parent of every task's cancellation token
    shutdown: CancellationToken,
}

/// Admits, tracks and drives search tasks
///
/// Cloning is cheap; clones share the same registry and workers.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Creates a scheduler over an injected task store
    ///
    /// # Arguments
    ///
    /// * `config` - Validated here; site rules become immutable
    /// * `store` - Registry of queued, active and archived tasks
    /// * `fetcher` - Network access for site workers
    /// * `extractor` - Page-to-data extraction
    /// * `events` - Outbound event queue
    ///
    /// # Returns
    ///
    /// * `Ok(TaskScheduler)` - Ready to accept submissions
    /// * `Err(HarvestError::Config)` - The configuration is invalid
    pub fn new(
        config: Config,
        store: Arc<TaskStore>,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn Extractor>,
        events: EventSender,
    ) -> Result<Self> {
        config::validate(&config)?;

        let sites = config
            .sites
            .iter()
            .map(|site| (site.id.clone(), Arc::new(site.clone())))
            .collect();
        let ctx = Arc::new(CrawlContext::new(&config, store, fetcher, extractor, events));

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                sites,
                ctx,
                controls: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.ctx.store
    }

    /// Queues a new search task
    ///
    /// Site rules are checked here, before any network activity. Work starts
    /// on spawned tasks, never synchronously, so this must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// * `EmptyQuery` / `NoSites` - Nothing to search
    /// * `Config` - Unknown site id or invalid site rules
    /// * `QueueFull` - `max-queue-size` tasks are already waiting
    pub fn submit(&self, query: &str, site_ids: &[&str], options: SubmitOptions) -> Result<TaskId> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HarvestError::EmptyQuery);
        }

        let mut seen = HashSet::new();
        let site_ids: Vec<String> = site_ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| seen.insert(*s))
            .map(str::to_string)
            .collect();
        if site_ids.is_empty() {
            return Err(HarvestError::NoSites);
        }

        for id in &site_ids {
            let checked = match self.inner.sites.get(id) {
                Some(site) => config::validate_site(site),
                None => Err(ConfigError::UnknownSite(id.clone())),
            };
            if let Err(e) = checked {
                let error = classify_config(Some(id.as_str()), &e);
                tracing::warn!(site = %id, kind = %error.kind, "Rejected task: {}", e);
                return Err(e.into());
            }
        }

        let options = options.resolve(&self.inner.config.scheduler);
        let task = Task::new(query.to_string(), site_ids, options);
        let task_id = task.id;

        self.store()
            .enqueue(task, self.inner.config.scheduler.max_queue_size)
            .map_err(|e| {
                tracing::warn!(query = %query, "Rejected task: {}", e);
                e
            })?;

        tracing::info!(task_id = %task_id, query = %query, "Task submitted");
        self.pump();
        Ok(task_id)
    }

    /// Admits queued tasks while slots are free
    fn pump(&self) {
        let max_active = self.inner.config.scheduler.max_concurrent_tasks;
        while let Some(task) = self.store().admit_next(max_active) {
            self.start(task);
        }
    }

    fn start(&self, task: Task) {
        let cancel = self.inner.shutdown.child_token();
        let (pause_tx, pause_rx) = watch::channel(false);

        self.inner.controls.lock().insert(
            task.id,
            TaskControl {
                cancel: cancel.clone(),
                pause: pause_tx,
            },
        );

        tracing::info!(
            task_id = %task.id,
            sites = task.site_ids.len(),
            timeout_ms = task.options.timeout_ms,
            "Task admitted"
        );
        self.inner.ctx.events.send(TaskEvent::TaskStarted {
            task_id: task.id,
            query: task.query.clone(),
            sites: task.site_ids.clone(),
        });

        let scheduler = self.clone();
        let signals = TaskSignals {
            cancel,
            paused: pause_rx,
        };
        tokio::spawn(async move {
            scheduler.drive(task, signals).await;
        });
    }

    /// Runs one admitted task until its sites finish, it is cancelled, or
    /// its deadline passes
    async fn drive(&self, task: Task, signals: TaskSignals) {
        let task_id = task.id;
        let options = task.options;
        let mut workers = JoinSet::new();

        for site_id in &task.site_ids {
            let Some(site) = self.inner.sites.get(site_id).cloned() else {
                // Checked at submission
                continue;
            };
            let coordinator = SiteCrawlCoordinator::new(
                self.inner.ctx.clone(),
                task_id,
                task.query.clone(),
                site,
                options.retry_attempts,
                signals.clone(),
            );
            workers.spawn(coordinator.run());
        }

        let deadline = tokio::time::sleep(options.timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = signals.cancel.cancelled() => break,
                _ = &mut deadline => {
                    self.expire(task_id, &options);
                    break;
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        tracing::error!(task_id = %task_id, "Site worker crashed: {}", e);
                        self.store().site_finished(&task_id, false);
                    }
                    None => break,
                },
            }
        }

        // Workers observe the token at their next suspension point
        signals.cancel.cancel();
        while workers.join_next().await.is_some() {}

        self.inner.controls.lock().remove(&task_id);

        if let Some(task) = self.store().get(&task_id) {
            if task.status.is_terminal() && task.errors.iter().all(|e| !is_task_level(e)) {
                self.announce_finished(&task);
            }
        }

        self.pump();
    }

    /// Forces a task past its deadline to `failed`, keeping partial results
    fn expire(&self, task_id: TaskId, options: &TaskOptions) {
        let error = CrawlError::task_timeout(options.timeout());
        if let Some(task) = self.store().terminate(&task_id, error.clone()) {
            tracing::warn!(
                task_id = %task_id,
                timeout_ms = options.timeout_ms,
                results = task.results.len(),
                "Task timed out"
            );
            self.inner.ctx.events.send(TaskEvent::TaskError { task_id, error });
            self.announce_finished(&task);
            self.pump();
        }
    }

    fn announce_finished(&self, task: &Task) {
        tracing::info!(
            task_id = %task.id,
            status = %task.status,
            completed = task.progress.completed,
            failed = task.progress.failed,
            results = task.results.len(),
            "Task archived"
        );
        self.inner.ctx.events.send(TaskEvent::TaskCompleted {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            results: task.results.len(),
            errors: task.errors.len(),
        });
    }

    /// Snapshot of a task from the queue, the active set or the archive
    pub fn get_status(&self, task_id: &TaskId) -> Option<Task> {
        self.store().get(task_id)
    }

    /// Parks a running task's workers before their next request
    ///
    /// Returns false unless the task was `running`.
    pub fn pause(&self, task_id: &TaskId) -> bool {
        self.set_paused(task_id, true)
    }

    /// Lets a paused task continue
    ///
    /// Returns false unless the task was `paused`.
    pub fn resume(&self, task_id: &TaskId) -> bool {
        self.set_paused(task_id, false)
    }

    fn set_paused(&self, task_id: &TaskId, paused: bool) -> bool {
        let (from, to) = if paused {
            (TaskStatus::Running, TaskStatus::Paused)
        } else {
            (TaskStatus::Paused, TaskStatus::Running)
        };

        let controls = self.inner.controls.lock();
        let Some(control) = controls.get(task_id) else {
            return false;
        };
        if !self.store().transition(task_id, from, to) {
            return false;
        }
        control.pause.send_replace(paused);

        tracing::info!(task_id = %task_id, status = %to, "Task {}", if paused { "paused" } else { "resumed" });
        true
    }

    /// Cancels a pending, running or paused task
    ///
    /// Appends exactly one cancellation error, releases the slot at once and
    /// signals the task's workers to stop. Results already collected are
    /// kept. Returns false if the task is unknown or already terminal.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let error = CrawlError::cancelled();
        let Some(task) = self.store().terminate(task_id, error.clone()) else {
            return false;
        };

        if let Some(control) = self.inner.controls.lock().get(task_id) {
            control.cancel.cancel();
        }

        tracing::info!(task_id = %task_id, results = task.results.len(), "Task cancelled");
        self.inner.ctx.events.send(TaskEvent::TaskError {
            task_id: *task_id,
            error,
        });
        self.announce_finished(&task);
        self.pump();
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        self.store().stats()
    }

    pub fn proxy_health(&self) -> Vec<ProxyHealthReport> {
        self.inner.ctx.supervisor.proxy_health()
    }

    /// Pacing, cooldown and proxy state for one site
    pub fn site_snapshot(&self, site_id: &str) -> SiteSnapshot {
        self.inner.ctx.supervisor.site_snapshot(site_id)
    }

    /// Purges archived tasks older than `older_than_hours`
    pub fn cleanup_archive(&self, older_than_hours: u64) -> usize {
        let removed = self.store().cleanup_archive(older_than_hours);
        if removed > 0 {
            tracing::info!(removed = removed, older_than_hours = older_than_hours, "Purged archived tasks");
        }
        removed
    }

    /// Waits until the task is terminal and returns its final snapshot
    pub async fn wait_for(&self, task_id: &TaskId) -> Option<Task> {
        self.store().wait_until_terminal(task_id).await
    }

    /// Starts a background task that purges the archive every `interval`
    /// using the configured retention
    pub fn spawn_archive_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let retention = self.inner.config.scheduler.archive_retention_hours;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.cleanup_archive(retention);
                    }
                }
            }
        })
    }

    /// Cancels every task and stops background work
    pub fn shutdown(&self) {
        let ids: Vec<TaskId> = self.inner.controls.lock().keys().copied().collect();
        for id in ids {
            self.cancel(&id);
        }
        self.inner.shutdown.cancel();
    }
}

/// Whether the scheduler itself appended this error (cancel or timeout),
/// in which case completion was already announced
fn is_task_level(error: &CrawlError) -> bool {
    error.site_id.is_none()
}
