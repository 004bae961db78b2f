use super::buffer::{CallbackBuffer, DispatchCallback, SimpleCallbackBuffer};
use super::rate::Rate;
use crate::errors::{PoolError, PoolResult};
use crate::scheduler::{Executor, Scheduler};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, trace, warn};

/// Permit-issuing limiter for callbacks.
pub trait AsyncRateLimiter: Send + Sync {
    /// Buffers `callback` until a permit is available.
    fn submit(&self, callback: DispatchCallback) -> PoolResult<()>;

    fn rate(&self) -> Rate;

    fn set_rate(&self, permits_per_period: f64, period: Duration, burst: usize) -> PoolResult<()>;

    /// Fails every buffered and future callback with `error`. One-shot.
    fn cancel_all(&self, error: PoolError);

    fn pending_tasks_count(&self) -> usize;
}

/// What `submit` does once the buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BufferOverflowMode {
    /// Reject the callback with [`PoolError::BufferFull`].
    #[default]
    Drop,
    /// Accept it anyway, log, and run over the limit to catch up.
    ScheduleWithWarning,
    /// The buffer cannot overflow.
    None,
}

/// Tracks how much buffered work is outstanding and whether the event loop
/// is parked.
pub trait ExecutionTracker: Send + Sync {
    /// Records a submission; returns `true` if the loop was parked and must
    /// be restarted.
    fn get_paused_and_increment(&self) -> bool;

    /// Records a dispatch; returns `true` if the loop should park.
    fn decrement_and_get_paused(&self) -> bool;

    fn pause_execution(&self);

    fn is_paused(&self) -> bool;

    fn pending(&self) -> usize;

    fn max_buffered(&self) -> usize;
}

/// Counts buffered callbacks, parking when none remain.
#[derive(Debug)]
pub struct BoundedExecutionTracker {
    pending: AtomicUsize,
    max_buffered: usize,
}

impl BoundedExecutionTracker {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            max_buffered,
        }
    }
}

impl ExecutionTracker for BoundedExecutionTracker {
    fn get_paused_and_increment(&self) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel) == 0
    }

    fn decrement_and_get_paused(&self) -> bool {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(1)))
            .unwrap_or(0);
        previous <= 1
    }

    fn pause_execution(&self) {
        self.pending.store(0, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn max_buffered(&self) -> usize {
        self.max_buffered
    }
}

/// Keeps the loop running until the buffer reports empty; used with
/// buffers that replay their entries.
#[derive(Debug)]
pub struct UnboundedExecutionTracker {
    paused: AtomicBool,
}

impl Default for UnboundedExecutionTracker {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(true),
        }
    }
}

impl ExecutionTracker for UnboundedExecutionTracker {
    fn get_paused_and_increment(&self) -> bool {
        self.paused.swap(false, Ordering::AcqRel)
    }

    fn decrement_and_get_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn pause_execution(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn pending(&self) -> usize {
        0
    }

    fn max_buffered(&self) -> usize {
        usize::MAX
    }
}

struct EventLoop {
    permit_time: Instant,
    permits_available: usize,
    permits_in_time_frame: usize,
    next_scheduled: Option<Instant>,
}

struct SmoothInner<B, K> {
    name: String,
    scheduler: Scheduler,
    executor: Arc<dyn Executor>,
    buffer: B,
    tracker: K,
    overflow_mode: BufferOverflowMode,
    rate: Mutex<Rate>,
    invocation_error: OnceLock<PoolError>,
    event_loop: Mutex<EventLoop>,
}

/// Re-issues `rate.events()` permits every `rate.period()` and dispatches
/// one buffered callback per permit through the executor.
///
/// The initial rate is [`Rate::ZERO`]: nothing is dispatched until
/// [`AsyncRateLimiter::set_rate`] is called.
pub struct SmoothRateLimiter<B = SimpleCallbackBuffer, K = BoundedExecutionTracker> {
    inner: Arc<SmoothInner<B, K>>,
}

impl SmoothRateLimiter {
    pub fn new(
        scheduler: Scheduler,
        executor: Arc<dyn Executor>,
        max_buffered: usize,
        overflow_mode: BufferOverflowMode,
        name: impl Into<String>,
    ) -> Self {
        Self::with_parts(
            scheduler,
            executor,
            SimpleCallbackBuffer::new(),
            BoundedExecutionTracker::new(max_buffered),
            overflow_mode,
            name,
        )
    }
}

impl<B, K> SmoothRateLimiter<B, K>
where
    B: CallbackBuffer + 'static,
    K: ExecutionTracker + 'static,
{
    pub fn with_parts(
        scheduler: Scheduler,
        executor: Arc<dyn Executor>,
        buffer: B,
        tracker: K,
        overflow_mode: BufferOverflowMode,
        name: impl Into<String>,
    ) -> Self {
        let rate = Rate::ZERO;
        Self {
            inner: Arc::new(SmoothInner {
                name: name.into(),
                scheduler,
                executor,
                buffer,
                tracker,
                overflow_mode,
                rate: Mutex::new(rate),
                invocation_error: OnceLock::new(),
                event_loop: Mutex::new(EventLoop {
                    permit_time: Instant::now(),
                    permits_available: rate.events(),
                    permits_in_time_frame: rate.events(),
                    next_scheduled: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn buffer(&self) -> &B {
        &self.inner.buffer
    }

    pub(crate) fn invocation_error(&self) -> Option<PoolError> {
        self.inner.invocation_error.get().cloned()
    }

    fn store_rate(&self, rate: Rate) {
        *self.inner.rate.lock() = rate;
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.spawn(move || {
            if let Some(inner) = weak.upgrade() {
                inner.update_with_new_rate();
            }
        });
    }
}

impl<B, K> SmoothInner<B, K>
where
    B: CallbackBuffer + 'static,
    K: ExecutionTracker + 'static,
{
    fn schedule_loop(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let run = move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_loop();
            }
        };
        if delay.is_zero() {
            self.scheduler.spawn(run);
        } else {
            self.scheduler.schedule(delay, run);
        }
    }

    fn update_with_new_rate(self: &Arc<Self>) {
        let rate = *self.rate.lock();
        {
            let mut event_loop = self.event_loop.lock();
            // Only the permits left in the current period remain usable.
            let used = event_loop
                .permits_in_time_frame
                .saturating_sub(event_loop.permits_available);
            event_loop.permits_available = rate.events().saturating_sub(used);
            event_loop.permits_in_time_frame = rate.events();
        }
        self.run_loop();
    }

    fn run_loop(self: &Arc<Self>) {
        let rate = *self.rate.lock();
        let now = Instant::now();
        let outcome = match self.invocation_error.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        let mut dispatch = Vec::new();
        {
            let mut event_loop = self.event_loop.lock();
            if now.saturating_duration_since(event_loop.permit_time) >= rate.period() {
                event_loop.permit_time = now;
                event_loop.permits_available = rate.events();
                event_loop.permits_in_time_frame = rate.events();
            }

            loop {
                if self.tracker.is_paused() {
                    break;
                }
                if self.tracker.pending() > self.tracker.max_buffered() {
                    // Prefer running above the limit over leaking callbacks.
                    event_loop.permits_available += 1;
                }
                if event_loop.permits_available == 0 {
                    let next_run = event_loop.permit_time + rate.period();
                    let due = next_run.saturating_duration_since(now);
                    let stale = event_loop
                        .next_scheduled
                        .is_none_or(|at| at > next_run || at <= now);
                    if stale {
                        event_loop.next_scheduled = Some(next_run);
                        self.schedule_loop(due);
                    }
                    break;
                }
                event_loop.permits_available -= 1;
                // Cancelled work is failed once, even from a replaying buffer.
                let next = if outcome.is_err() {
                    self.buffer.take()
                } else {
                    self.buffer.get()
                };
                match next {
                    Ok(callback) => dispatch.push(callback),
                    Err(_) => {
                        self.tracker.pause_execution();
                        break;
                    }
                }
                if self.tracker.decrement_and_get_paused() {
                    break;
                }
            }
        }

        if !dispatch.is_empty() {
            trace!(limiter = %self.name, count = dispatch.len(), "dispatching callbacks");
        }
        for callback in dispatch {
            let outcome = outcome.clone();
            self.executor.execute(Box::new(move || callback(outcome)));
        }
    }
}

impl<B, K> AsyncRateLimiter for SmoothRateLimiter<B, K>
where
    B: CallbackBuffer + 'static,
    K: ExecutionTracker + 'static,
{
    fn submit(&self, callback: DispatchCallback) -> PoolResult<()> {
        let tracker = &self.inner.tracker;
        if tracker.pending() >= tracker.max_buffered() {
            match self.inner.overflow_mode {
                BufferOverflowMode::Drop => {
                    return Err(PoolError::BufferFull {
                        max_buffered: tracker.max_buffered(),
                        limiter: self.inner.name.clone(),
                    });
                }
                BufferOverflowMode::ScheduleWithWarning => {
                    warn!(
                        limiter = %self.inner.name,
                        max_buffered = tracker.max_buffered(),
                        "buffer is full, running a callback over the limit"
                    );
                }
                BufferOverflowMode::None => {}
            }
        }

        self.inner.buffer.put(callback);
        if tracker.get_paused_and_increment() {
            self.inner.schedule_loop(Duration::ZERO);
        }
        Ok(())
    }

    fn rate(&self) -> Rate {
        *self.inner.rate.lock()
    }

    fn set_rate(&self, permits_per_period: f64, period: Duration, burst: usize) -> PoolResult<()> {
        let rate = Rate::new(permits_per_period, period, burst)?;
        self.store_rate(rate);
        Ok(())
    }

    fn cancel_all(&self, error: PoolError) {
        if self.inner.invocation_error.set(error).is_err() {
            error!(limiter = %self.inner.name, "cancel_all should only be invoked once");
            return;
        }
        // Errors are not rate limited.
        self.store_rate(Rate::MAX);
    }

    fn pending_tasks_count(&self) -> usize {
        self.inner.tracker.pending()
    }
}
