//! State module for tracking task and site progress
//!
//! # Components
//!
//! - `TaskStatus`: lifecycle of a whole search task (pending, running, paused, completed, failed)
//! - `Progress`: per-task site counters
//! - `RateLimitState`: per-site adaptive delay, Retry-After floor and cooldown

mod rate_state;
mod task_state;

pub use rate_state::RateLimitState;
pub use task_state::{Progress, TaskStatus};
