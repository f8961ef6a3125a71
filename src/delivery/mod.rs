//! Message delivery: the per-queue delivery task and the scheduler driving it.

mod scheduler;
mod task;

use std::fmt;

pub use scheduler::TaskScheduler;
pub use task::MessageDeliveryTask;

/// Re-scheduling hint returned by a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHint {
    /// More work is likely available; run again soon.
    Active,
    /// Nothing to do; back off until woken.
    Idle,
}

impl TaskHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for TaskHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work driven repeatedly by the [`TaskScheduler`].
pub trait Task: Send + Sync {
    /// Scheduling key. At most one run per key is in flight.
    fn id(&self) -> &str;

    fn call(&self) -> TaskHint;

    fn on_add(&self) {}

    fn on_remove(&self) {}
}
