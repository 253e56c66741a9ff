//! Statistics display
//!
//! Formats scheduler counters, per-task summaries and proxy health for the
//! command line.

use crate::antibot::ProxyHealthReport;
use crate::crawler::{SchedulerStats, Task};
use crate::ErrorKind;
use std::collections::BTreeMap;

/// Per-task summary, counting errors by kind
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub results: usize,
    pub sites_completed: u32,
    pub sites_failed: u32,
    pub sites_total: u32,
    pub errors_by_kind: BTreeMap<&'static str, usize>,
    pub duration_ms: Option<i64>,
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        let mut errors_by_kind = BTreeMap::new();
        for error in &task.errors {
            *errors_by_kind.entry(error.kind.as_str()).or_insert(0) += 1;
        }

        Self {
            results: task.results.len(),
            sites_completed: task.progress.completed,
            sites_failed: task.progress.failed,
            sites_total: task.progress.total,
            errors_by_kind,
            duration_ms: task.completion_time().map(|d| d.num_milliseconds()),
        }
    }

    /// Number of errors of `kind`
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.errors_by_kind.get(kind.as_str()).copied().unwrap_or(0)
    }
}

/// Prints a finished task's summary to stdout
pub fn print_task_summary(task: &Task) {
    let summary = TaskSummary::from_task(task);

    println!("=== Task {} ===\n", task.id);
    println!("  Query: {}", task.query);
    println!("  Status: {}", task.status);
    println!(
        "  Sites: {} completed, {} failed, {} total",
        summary.sites_completed, summary.sites_failed, summary.sites_total
    );
    println!("  Results: {}", summary.results);
    if let Some(ms) = summary.duration_ms {
        println!("  Duration: {:.1}s", ms as f64 / 1000.0);
    }
    println!();

    if !summary.errors_by_kind.is_empty() {
        println!("Errors by Kind:");
        let mut counts: Vec<_> = summary.errors_by_kind.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1));
        for (kind, count) in counts {
            println!("  {}: {}", kind, count);
        }
        println!();
    }
}

/// Prints scheduler statistics and proxy health to stdout
///
/// # Arguments
///
/// * `stats` - Registry counters
/// * `proxies` - Health snapshot of the proxy pool (may be empty)
pub fn print_statistics(stats: &SchedulerStats, proxies: &[ProxyHealthReport]) {
    println!("=== Scheduler Statistics ===\n");

    println!("Tasks:");
    println!("  Queued: {}", stats.queued);
    println!("  Running: {}", stats.running);
    println!("  Paused: {}", stats.paused);
    println!(
        "  Archived: {} ({} completed, {} failed)",
        stats.archived, stats.archived_completed, stats.archived_failed
    );
    match stats.average_completion_ms {
        Some(ms) => println!("  Average completion time: {:.0}ms", ms),
        None => println!("  Average completion time: n/a"),
    }
    println!();

    if !proxies.is_empty() {
        println!("Proxies ({}):", proxies.len());
        for proxy in proxies {
            println!(
                "  {} health {:.1} ({} ok / {} failed, avg {:.0}ms){}",
                proxy.proxy,
                proxy.health_score,
                proxy.success_count,
                proxy.failure_count,
                proxy.avg_response_ms,
                if proxy.cooling_down { " [cooling down]" } else { "" }
            );
        }
        println!();
    }

    let success_rate = if stats.archived > 0 {
        (stats.archived_completed as f64 / stats.archived as f64) * 100.0
    } else {
        0.0
    };
    println!(
        "Success Rate: {:.1}% ({} / {} tasks completed)",
        success_rate, stats.archived_completed, stats.archived
    );
}
