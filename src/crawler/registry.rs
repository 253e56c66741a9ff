//! In-memory task registry
//!
//! Holds every task in exactly one of three places: the FIFO queue, the
//! active map (tasks holding a concurrency slot) or the archive. All
//! mutation goes through one lock, so admission, completion, cancellation
//! and timeout cannot race each other, and progress increments are never
//! lost.

use super::task::{StructuredResult, Task, TaskId};
use crate::failure::CrawlError;
use crate::state::{Progress, TaskStatus};
use crate::HarvestError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Registry {
    queued: VecDeque<Task>,
    active: HashMap<TaskId, Task>,
    archived: HashMap<TaskId, Task>,
}

impl Registry {
    /// Moves a task that just became terminal into the archive
    fn archive(&mut self, task: Task) {
        self.archived.insert(task.id, task);
    }

    fn active_running(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.active
            .get_mut(id)
            .filter(|task| !task.status.is_terminal())
    }
}

/// Outcome of reporting a finished site
#[derive(Debug, Clone, Copy)]
pub struct SiteFinish {
    pub progress: Progress,
    pub estimated_end_time: Option<chrono::DateTime<Utc>>,
    /// Set when this was the task's last site
    pub final_status: Option<TaskStatus>,
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub archived: usize,
    pub archived_completed: usize,
    pub archived_failed: usize,
    /// Mean admission-to-end time over archived completed tasks
    pub average_completion_ms: Option<f64>,
}

impl SchedulerStats {
    pub fn active(&self) -> usize {
        self.running + self.paused
    }
}

/// Owned task store, injected into the scheduler
#[derive(Debug, Default)]
pub struct TaskStore {
    inner: Mutex<Registry>,
    changed: Notify,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task to the queue
    ///
    /// # Errors
    ///
    /// `QueueFull` when `capacity` tasks are already waiting
    pub fn enqueue(&self, task: Task, capacity: usize) -> Result<(), HarvestError> {
        let mut registry = self.inner.lock();
        if registry.queued.len() >= capacity {
            return Err(HarvestError::QueueFull { capacity });
        }
        registry.queued.push_back(task);
        Ok(())
    }

    /// Admits the oldest queued task if fewer than `max_active` hold a slot
    ///
    /// Returns a snapshot of the admitted task, now `running`.
    pub fn admit_next(&self, max_active: usize) -> Option<Task> {
        let mut registry = self.inner.lock();
        if registry.active.len() >= max_active {
            return None;
        }

        let mut task = registry.queued.pop_front()?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let snapshot = task.clone();
        registry.active.insert(task.id, task);
        drop(registry);

        self.changed.notify_waiters();
        Some(snapshot)
    }

    /// Copy of the task from whichever collection holds it
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        let registry = self.inner.lock();
        registry
            .active
            .get(id)
            .or_else(|| registry.queued.iter().find(|t| t.id == *id))
            .or_else(|| registry.archived.get(id))
            .cloned()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        let registry = self.inner.lock();
        registry
            .active
            .get(id)
            .or_else(|| registry.queued.iter().find(|t| t.id == *id))
            .or_else(|| registry.archived.get(id))
            .map(|t| t.status)
    }

    /// Whether the task can take no more results
    ///
    /// Terminal and unknown tasks count as full.
    pub fn is_full(&self, id: &TaskId) -> bool {
        let mut registry = self.inner.lock();
        registry.active_running(id).map_or(true, |t| t.is_full())
    }

    /// Appends a result unless the task is terminal or already full
    pub fn record_result(&self, id: &TaskId, result: StructuredResult) -> bool {
        let mut registry = self.inner.lock();
        match registry.active_running(id) {
            Some(task) if !task.is_full() => {
                task.results.push(result);
                true
            }
            _ => false,
        }
    }

    /// Appends an error unless the task is already terminal
    pub fn record_error(&self, id: &TaskId, error: CrawlError) -> bool {
        let mut registry = self.inner.lock();
        match registry.active_running(id) {
            Some(task) => {
                task.errors.push(error);
                true
            }
            None => false,
        }
    }

    /// Counts one site as finished and finalizes the task on its last site
    ///
    /// A finished task is `completed` when at least one site completed,
    /// `failed` otherwise, and moves to the archive in the same step.
    pub fn site_finished(&self, id: &TaskId, success: bool) -> Option<SiteFinish> {
        let mut registry = self.inner.lock();
        let task = registry.active_running(id)?;

        let counted = if success {
            task.progress.record_completed()
        } else {
            task.progress.record_failed()
        };
        if !counted {
            return None;
        }

        let now = Utc::now();
        task.update_estimate(now);

        let mut finish = SiteFinish {
            progress: task.progress,
            estimated_end_time: task.estimated_end_time,
            final_status: None,
        };

        if task.progress.is_done() {
            let status = if task.progress.completed > 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            task.status = status;
            task.ended_at = Some(now);
            finish.final_status = Some(status);

            if let Some(task) = registry.active.remove(id) {
                registry.archive(task);
            }
            drop(registry);
            self.changed.notify_waiters();
        }

        Some(finish)
    }

    /// Forces a non-terminal task to `failed`, appending `error`
    ///
    /// Used for cancellation and timeouts. Outstanding sites are counted as
    /// failed, the concurrency slot is released and collected results are
    /// kept. Returns the final snapshot, or None if the task was unknown or
    /// already terminal.
    pub fn terminate(&self, id: &TaskId, error: CrawlError) -> Option<Task> {
        let mut registry = self.inner.lock();

        let mut task = if let Some(task) = registry.active.remove(id) {
            task
        } else {
            let position = registry.queued.iter().position(|t| t.id == *id)?;
            registry.queued.remove(position)?
        };

        task.errors.push(error);
        task.progress.fail_remaining();
        task.status = TaskStatus::Failed;
        task.ended_at = Some(Utc::now());
        task.estimated_end_time = None;

        let snapshot = task.clone();
        registry.archive(task);
        drop(registry);

        self.changed.notify_waiters();
        Some(snapshot)
    }

    /// Applies `running -> paused` or `paused -> running`
    ///
    /// Returns false for any other transition.
    pub fn transition(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> bool {
        if !from.holds_slot() || !to.holds_slot() || !from.can_transition_to(to) {
            return false;
        }

        let mut registry = self.inner.lock();
        match registry.active.get_mut(id) {
            Some(task) if task.status == from => {
                task.status = to;
                true
            }
            _ => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().queued.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let registry = self.inner.lock();

        let paused = registry
            .active
            .values()
            .filter(|t| t.status == TaskStatus::Paused)
            .count();

        let completion_times: Vec<f64> = registry
            .archived
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.completion_time())
            .map(|d| d.num_milliseconds() as f64)
            .collect();

        let average_completion_ms = if completion_times.is_empty() {
            None
        } else {
            Some(completion_times.iter().sum::<f64>() / completion_times.len() as f64)
        };

        SchedulerStats {
            queued: registry.queued.len(),
            running: registry.active.len() - paused,
            paused,
            archived: registry.archived.len(),
            archived_completed: completion_times.len(),
            archived_failed: registry
                .archived
                .values()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            average_completion_ms,
        }
    }

    /// Purges archived tasks that ended more than `older_than_hours` ago
    ///
    /// Returns the number of tasks removed.
    pub fn cleanup_archive(&self, older_than_hours: u64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(older_than_hours as i64);
        let mut registry = self.inner.lock();
        let before = registry.archived.len();
        registry
            .archived
            .retain(|_, task| task.ended_at.map_or(true, |ended| ended > cutoff));
        before - registry.archived.len()
    }

    /// Resolves with the final snapshot once the task is terminal
    ///
    /// Returns None if the task is unknown, including after it has been
    /// purged from the archive.
    pub async fn wait_until_terminal(&self, id: &TaskId) -> Option<Task> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let task = self.get(id)?;
            if task.status.is_terminal() {
                return Some(task);
            }

            changed.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_archived(&self, id: &TaskId, by: chrono::Duration) {
        let mut registry = self.inner.lock();
        if let Some(task) = registry.archived.get_mut(id) {
            task.ended_at = task.ended_at.map(|t| t - by);
            task.started_at = task.started_at.map(|t| t - by);
        }
    }
}
