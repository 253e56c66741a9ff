//! Task lifecycle state definitions
//!
//! Status moves forward only (`pending -> running -> completed|failed`), with
//! the single exception of the `running <-> paused` cycle.

use serde::Serialize;
use std::fmt;

/// Represents the current lifecycle state of a search task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    // ===== Active States =====
    /// Task is waiting in the queue for a concurrency slot
    Pending,

    /// Task holds a slot and its site workers are crawling
    Running,

    /// Task holds a slot but its workers are parked before their next request
    Paused,

    // ===== Terminal States =====
    /// Every site finished and at least one completed
    Completed,

    /// Every site failed, or the task was cancelled or timed out
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the task currently occupies a concurrency slot
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Checks whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }

    /// Converts the status to its wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-task progress, counted in sites rather than items
///
/// `completed + failed <= total` always holds; equality holds exactly when
/// the owning task is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl Progress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
        }
    }

    /// Number of sites that have finished, either way
    pub fn finished(&self) -> u32 {
        self.completed + self.failed
    }

    /// Number of sites still outstanding
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.finished())
    }

    pub fn is_done(&self) -> bool {
        self.finished() >= self.total
    }

    /// Records one completed site; returns false if nothing was outstanding
    pub fn record_completed(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.completed += 1;
        true
    }

    /// Records one failed site; returns false if nothing was outstanding
    pub fn record_failed(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.failed += 1;
        true
    }

    /// Marks every outstanding site as failed
    pub fn fail_remaining(&mut self) {
        self.failed += self.remaining();
    }

    /// Fraction of sites finished, in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.finished() as f64 / self.total as f64
    }
}
