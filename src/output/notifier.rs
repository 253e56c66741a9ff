//! Outbound event queue
//!
//! Orchestration code pushes events into a bounded channel with `try_send`
//! and never waits on delivery. A dispatcher task drains the channel into
//! the configured `Notifier`.

use super::traits::{Notifier, TaskEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default number of events buffered before new ones are dropped
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Non-blocking handle for publishing task events
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::Sender<TaskEvent>>,
}

impl EventSender {
    /// A sender that discards every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publishes an event without waiting
    ///
    /// When the queue is full or the dispatcher is gone the event is dropped
    /// and a warning is logged.
    pub fn send(&self, event: TaskEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    task_id = %event.task_id(),
                    event = event.name(),
                    "Event queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(
                    task_id = %event.task_id(),
                    event = event.name(),
                    "Notifier stopped, dropping event"
                );
            }
        }
    }
}

/// Starts the dispatcher task feeding `notifier`
///
/// The dispatcher exits once every `EventSender` clone has been dropped.
///
/// # Arguments
///
/// * `notifier` - Destination for events
/// * `capacity` - Events buffered before new ones are dropped
///
/// # Returns
///
/// The sender to hand to the scheduler, and the dispatcher's handle
pub fn spawn_notifier(
    notifier: Arc<dyn Notifier>,
    capacity: usize,
) -> (EventSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<TaskEvent>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            notifier.emit(event).await;
        }
        tracing::debug!("Event dispatcher stopped");
    });

    (EventSender { tx: Some(tx) }, handle)
}

/// Notifier that writes every event through `tracing`
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn emit(&self, event: TaskEvent) {
        match &event {
            TaskEvent::TaskStarted { task_id, query, sites } => {
                tracing::info!(task_id = %task_id, query = %query, sites = sites.len(), "Task started");
            }
            TaskEvent::TaskProgress {
                task_id,
                site_id,
                progress,
                ..
            } => {
                tracing::info!(
                    task_id = %task_id,
                    site = %site_id,
                    completed = progress.completed,
                    failed = progress.failed,
                    total = progress.total,
                    "Site finished"
                );
            }
            TaskEvent::TaskResult { task_id, result } => {
                tracing::debug!(task_id = %task_id, site = %result.site_id, url = %result.url, "Result");
            }
            TaskEvent::TaskError { task_id, error } => {
                tracing::warn!(task_id = %task_id, error = %error, "Task error");
            }
            TaskEvent::TaskCompleted {
                task_id,
                status,
                results,
                errors,
                ..
            } => {
                tracing::info!(
                    task_id = %task_id,
                    status = %status,
                    results = results,
                    errors = errors,
                    "Task finished"
                );
            }
        }
    }
}
