use super::{RateLimiter, Task, TaskDone};
use crate::config::RateLimiterConfiguration;
use crate::errors::PoolResult;
use crate::scheduler::{ScheduledTask, Scheduler};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

struct BackOffState {
    period: Duration,
    running: usize,
    pending: VecDeque<Task>,
    timer: Option<ScheduledTask>,
}

struct BackOffInner {
    config: RateLimiterConfiguration,
    scheduler: Scheduler,
    state: Mutex<BackOffState>,
}

/// Rate limiter whose period doubles on every failure and resets on success.
///
/// While the period is zero and fewer than `max_running_tasks` tasks run,
/// submissions run immediately. Otherwise they queue in FIFO order and are
/// released one per period by a self-rescheduling timer.
#[derive(Clone)]
pub struct ExponentialBackOffRateLimiter {
    inner: Arc<BackOffInner>,
}

impl ExponentialBackOffRateLimiter {
    pub fn new(config: RateLimiterConfiguration, scheduler: Scheduler) -> PoolResult<Self> {
        config.validate()?;
        let period = config.min_period;
        Ok(Self {
            inner: Arc::new(BackOffInner {
                config,
                scheduler,
                state: Mutex::new(BackOffState {
                    period,
                    running: 0,
                    pending: VecDeque::new(),
                    timer: None,
                }),
            }),
        })
    }

    pub fn period(&self) -> Duration {
        self.inner.state.lock().period
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }
}

impl BackOffInner {
    fn clamp(&self, period: Duration) -> Duration {
        period.clamp(self.config.min_period, self.config.max_period)
    }

    fn done_token(self: &Arc<Self>) -> TaskDone {
        let weak = Arc::downgrade(self);
        TaskDone::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.task_done();
            }
        })
    }

    fn task_done(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        self.schedule_if_needed(&mut state);
    }

    /// Must be called with the state lock held.
    fn schedule_if_needed(self: &Arc<Self>, state: &mut BackOffState) {
        if state.timer.is_some()
            || state.pending.is_empty()
            || state.running >= self.config.max_running_tasks
        {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        trace!(period = ?state.period, "scheduling next rate limited task");
        state.timer = Some(self.scheduler.schedule(state.period, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_next();
            }
        }));
    }

    fn run_next(self: &Arc<Self>) {
        let task = {
            let mut state = self.state.lock();
            state.timer = None;
            let task = if state.running < self.config.max_running_tasks {
                state.pending.pop_front()
            } else {
                None
            };
            if task.is_some() {
                state.running += 1;
            }
            self.schedule_if_needed(&mut state);
            task
        };
        if let Some(task) = task {
            task.run(self.done_token());
        }
    }
}

impl RateLimiter for ExponentialBackOffRateLimiter {
    fn submit(&self, task: Task) {
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.period.is_zero()
                && state.pending.is_empty()
                && state.running < self.inner.config.max_running_tasks
            {
                state.running += 1;
                Some(task)
            } else {
                state.pending.push_back(task);
                self.inner.schedule_if_needed(&mut state);
                None
            }
        };
        if let Some(task) = run_now {
            task.run(self.inner.done_token());
        }
    }

    fn set_period(&self, period: Duration) {
        let mut state = self.inner.state.lock();
        let period = self.inner.clamp(period);
        if state.period == period {
            return;
        }
        state.period = period;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        self.inner.schedule_if_needed(&mut state);
    }

    fn increment_period(&self) {
        let mut state = self.inner.state.lock();
        let next = if state.period.is_zero() {
            self.inner.config.initial_increment
        } else {
            state.period.saturating_mul(2)
        };
        state.period = self.inner.clamp(next);
        debug!(period = ?state.period, "backing off");
    }

    fn cancel_pending_tasks(&self) -> Vec<Task> {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.pending.drain(..).collect()
    }
}
