//! Admission control for item creation
//!
//! Two families live here. [`RateLimiter`] gates pool tasks (creating a new
//! item) and is what the pools consume. [`AsyncRateLimiter`] issues permits
//! to buffered callbacks at a configured [`Rate`].

mod backoff;
mod buffer;
mod constant_qps;
mod evicting;
mod rate;
mod smooth;

pub use backoff::ExponentialBackOffRateLimiter;
pub use buffer::{CallbackBuffer, DispatchCallback, SimpleCallbackBuffer};
pub use constant_qps::ConstantQpsRateLimiter;
pub use evicting::EvictingCircularBuffer;
pub use rate::Rate;
pub use smooth::{
    AsyncRateLimiter, BoundedExecutionTracker, BufferOverflowMode, ExecutionTracker,
    SmoothRateLimiter, UnboundedExecutionTracker,
};

use std::fmt;
use std::time::Duration;

/// Completion token handed to a running [`Task`].
///
/// Dropping the token reports completion just like [`TaskDone::done`].
pub struct TaskDone {
    on_done: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskDone {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            on_done: Some(Box::new(f)),
        }
    }

    /// A token that reports to nobody.
    pub fn detached() -> Self {
        Self { on_done: None }
    }

    pub fn done(self) {}
}

impl Drop for TaskDone {
    fn drop(&mut self) {
        if let Some(f) = self.on_done.take() {
            f();
        }
    }
}

impl fmt::Debug for TaskDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskDone")
    }
}

/// A unit of rate limited work.
pub struct Task {
    run: Box<dyn FnOnce(TaskDone) + Send>,
}

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(TaskDone) + Send + 'static,
    {
        Self { run: Box::new(f) }
    }

    pub fn run(self, done: TaskDone) {
        (self.run)(done)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

/// Throttles how fast tasks run.
///
/// Implementations use their own locks and never call back into a pool
/// while holding them.
pub trait RateLimiter: Send + Sync {
    /// Runs `task` now if allowed, otherwise queues it.
    fn submit(&self, task: Task);

    fn set_period(&self, period: Duration);

    fn increment_period(&self);

    /// Removes and returns every task still queued.
    fn cancel_pending_tasks(&self) -> Vec<Task>;
}

/// Runs every task synchronously on submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn submit(&self, task: Task) {
        task.run(TaskDone::detached())
    }

    fn set_period(&self, _period: Duration) {}

    fn increment_period(&self) {}

    fn cancel_pending_tasks(&self) -> Vec<Task> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_noop_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        NoopRateLimiter.submit(Task::new(move |done| {
            counter.fetch_add(1, Ordering::SeqCst);
            done.done();
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(NoopRateLimiter.cancel_pending_tasks().is_empty());
    }

    #[test]
    fn test_dropped_token_reports_done() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        drop(TaskDone::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
