//! Deadline scheduling on top of the tokio runtime

use crate::errors::{PoolError, PoolResult};

use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Runs jobs handed to it, possibly on another thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Executor that runs every job on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job()
    }
}

/// Schedule-once and schedule-at-fixed-rate primitives.
///
/// All deadlines are measured with [`tokio::time::Instant`], so a paused
/// test runtime controls them.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling context.
    pub fn current() -> PoolResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| PoolError::IllegalState(format!("no tokio runtime available: {e}")))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    /// Runs `f` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle.spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            f()
        });
        ScheduledTask { handle }
    }

    /// Runs `f` every `period`, first after one full period.
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, f: F) -> ScheduledTask
    where
        F: Fn() + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let handle = self.handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        });
        ScheduledTask { handle }
    }
}

impl Executor for Scheduler {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        self.spawn(job)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// A pending scheduled job.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Best-effort cancellation: a job that already started still runs.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
