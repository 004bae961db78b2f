use super::{AsyncPool, PoolState, PutBack, TimedItem, await_shutdown, checkout};
use crate::callback::{Callback, Cancellable};
use crate::config::{PoolConfiguration, Strategy};
use crate::errors::{PoolError, PoolResult};
use crate::lifecycle::Lifecycle;
use crate::linked_deque::{LinkedDeque, NodeHandle};
use crate::metrics::{PoolGauges, PoolStats, PoolStatsTracker};
use crate::ratelimiter::{RateLimiter, Task, TaskDone};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::timeout::TimeoutCallback;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Everything the pool lock protects.
struct ExclusiveState<T> {
    state: PoolState,
    /// Idle plus checked-out plus in-flight creations.
    pool_size: usize,
    checked_out: usize,
    idle: VecDeque<TimedItem<T>>,
    waiters: LinkedDeque<Callback<T>>,
    shutdown_callback: Option<Callback<()>>,
    reaper: Option<ScheduledTask>,
}

/// Work left over when shutdown completes, run after the lock is released.
struct ShutdownFinish<T> {
    callback: Callback<()>,
    idle: Vec<T>,
    reaper: Option<ScheduledTask>,
}

struct PoolInner<T> {
    name: String,
    config: PoolConfiguration,
    lifecycle: Arc<dyn Lifecycle<T>>,
    rate_limiter: Arc<dyn RateLimiter>,
    scheduler: Scheduler,
    state: Arc<Mutex<ExclusiveState<T>>>,
    stats: Arc<PoolStatsTracker>,
}

/// A pool where each item is held by at most one borrower.
///
/// Items are created on demand up to `max_size`, reused in MRU or LRU order,
/// and destroyed when idle for longer than the idle timeout (never dropping
/// below `min_size`). Creation is paced by a [`RateLimiter`] that backs off
/// while the lifecycle keeps failing.
///
/// # Examples
///
/// ```
/// use transport_pool::{
///     AsyncPool, Callback, ExclusivePool, Lifecycle, NoopRateLimiter, PoolConfiguration, Scheduler,
/// };
/// use std::sync::Arc;
///
/// struct Numbers;
///
/// impl Lifecycle<u32> for Numbers {
///     fn create(&self, callback: Callback<u32>) {
///         callback.on_success(42);
///     }
///     fn validate_get(&self, _item: &u32) -> bool {
///         true
///     }
///     fn validate_put(&self, _item: &u32) -> bool {
///         true
///     }
///     fn destroy(&self, item: u32, _error: bool, callback: Callback<u32>) {
///         callback.on_success(item);
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = ExclusivePool::new(
///     "numbers",
///     Arc::new(Numbers),
///     PoolConfiguration::default().with_max_size(2),
///     Arc::new(NoopRateLimiter),
///     Scheduler::current().unwrap(),
/// )
/// .unwrap();
/// pool.start().unwrap();
///
/// let item = pool.get_async().await.unwrap();
/// assert_eq!(item, 42);
/// pool.put(item);
/// pool.shutdown_async().await.unwrap();
/// # }
/// ```
pub struct ExclusivePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> ExclusivePool<T> {
    pub fn new(
        name: impl Into<String>,
        lifecycle: Arc<dyn Lifecycle<T>>,
        config: PoolConfiguration,
        rate_limiter: Arc<dyn RateLimiter>,
        scheduler: Scheduler,
    ) -> PoolResult<Self> {
        config.validate()?;

        let state = Arc::new(Mutex::new(ExclusiveState {
            state: PoolState::NotStarted,
            pool_size: 0,
            checked_out: 0,
            idle: VecDeque::new(),
            waiters: LinkedDeque::new(),
            shutdown_callback: None,
            reaper: None,
        }));

        let gauge_state = Arc::clone(&state);
        let (max_size, min_size) = (config.max_size, config.min_size);
        let stats = Arc::new(PoolStatsTracker::new(move || {
            let st = gauge_state.lock();
            PoolGauges {
                max_size,
                min_size,
                pool_size: st.pool_size,
                checked_out: st.checked_out,
                idle_count: st.idle.len(),
                waiter_count: st.waiters.len(),
            }
        }));

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                lifecycle,
                rate_limiter,
                scheduler,
                state,
                stats,
            }),
        })
    }

    pub fn state(&self) -> PoolState {
        self.inner.state.lock().state
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    /// Awaits an item. Dropping the future withdraws the request.
    pub async fn get_async(&self) -> PoolResult<T> {
        let weak = Arc::downgrade(&self.inner);
        let put_back: PutBack<T> = Arc::new(move |item| {
            if let Some(inner) = weak.upgrade() {
                inner.put(item);
            }
        });
        checkout(|callback| self.inner.get(callback), put_back).await
    }

    pub async fn shutdown_async(&self) -> PoolResult<()> {
        await_shutdown(|callback| self.inner.shutdown(callback)).await
    }
}

impl<T: Send + 'static> AsyncPool<T> for ExclusivePool<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self) -> PoolResult<()> {
        self.inner.start()
    }

    fn shutdown(&self, callback: Callback<()>) {
        self.inner.shutdown(callback)
    }

    fn get(&self, callback: Callback<T>) -> Cancellable {
        self.inner.get(callback)
    }

    fn put(&self, item: T) {
        self.inner.put(item)
    }

    fn dispose(&self, item: T) {
        self.inner.dispose(item)
    }

    fn cancel_waiters(&self) -> Vec<Callback<T>> {
        self.inner.cancel_waiters()
    }

    fn get_stats(&self) -> PoolStats {
        self.inner.stats.get_stats()
    }
}

impl<T: Send + 'static> PoolInner<T> {
    fn start(self: &Arc<Self>) -> PoolResult<()> {
        let creates = {
            let mut st = self.state.lock();
            if st.state != PoolState::NotStarted {
                return Err(PoolError::illegal_state(&self.name, st.state));
            }
            st.state = PoolState::Running;

            if let Some(period) = self.config.reap_period() {
                let weak = Arc::downgrade(self);
                st.reaper = Some(self.scheduler.schedule_at_fixed_rate(period, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.timeout_objects();
                    }
                }));
            }

            let mut creates = 0;
            while self.should_create(&mut st) {
                creates += 1;
            }
            creates
        };

        info!(pool = %self.name, prewarm = creates, "pool started");
        for _ in 0..creates {
            self.create();
        }
        Ok(())
    }

    fn get(self: &Arc<Self>, callback: Callback<T>) -> Cancellable {
        let requested = Instant::now();
        let stats = Arc::clone(&self.stats);
        let mut callback = Some(callback.before(move |_| stats.track_wait_time(requested.elapsed())));

        loop {
            let mut st = self.state.lock();
            if st.state != PoolState::Running {
                let error = PoolError::illegal_state(&self.name, st.state);
                drop(st);
                if let Some(callback) = callback.take() {
                    callback.on_error(error);
                }
                return Cancellable::resolved();
            }

            let candidate = match self.config.strategy {
                Strategy::Mru => st.idle.pop_back(),
                Strategy::Lru => st.idle.pop_front(),
            };

            let Some(TimedItem { item, .. }) = candidate else {
                if st.waiters.len() >= self.config.max_waiters {
                    drop(st);
                    if let Some(callback) = callback.take() {
                        callback.on_error(PoolError::SizeLimitExceeded {
                            pool: self.name.clone(),
                            max_waiters: self.config.max_waiters,
                        });
                    }
                    return Cancellable::resolved();
                }
                let Some(callback) = callback.take() else {
                    return Cancellable::resolved();
                };
                let (waiter, node_cell) = self.bound_waiter(callback);
                let node = st.waiters.push_back(waiter);
                if let Some(cell) = node_cell {
                    *cell.lock() = Some(node);
                }
                let create = self.should_create(&mut st);
                drop(st);

                trace!(pool = %self.name, "request queued");
                if create {
                    self.create();
                }
                let weak = Arc::downgrade(self);
                return Cancellable::new(move || {
                    weak.upgrade().is_some_and(|inner| inner.cancel_waiter(node))
                });
            };
            drop(st);

            if self.lifecycle.validate_get(&item) {
                {
                    let mut st = self.state.lock();
                    st.checked_out += 1;
                    self.stats.sample_max_checked_out(st.checked_out);
                }
                if let Some(callback) = callback.take() {
                    callback.on_success(item);
                }
                return Cancellable::resolved();
            }

            debug!(pool = %self.name, "idle item failed validation");
            self.destroy(item, true);
        }
    }

    /// Applies the waiter timeout, if any. The returned cell receives the
    /// waiter's node once it is enqueued so the deadline can unlink it.
    fn bound_waiter(
        self: &Arc<Self>,
        callback: Callback<T>,
    ) -> (Callback<T>, Option<Arc<Mutex<Option<NodeHandle>>>>) {
        let Some(timeout) = self.config.waiter_timeout else {
            return (callback, None);
        };

        let cell = Arc::new(Mutex::new(None));
        let expired = Arc::downgrade(self);
        let late = Arc::downgrade(self);
        let node_cell = Arc::clone(&cell);
        let waiter = TimeoutCallback::new(callback)
            .on_timeout(move || {
                if let Some(inner) = expired.upgrade() {
                    inner.remove_expired_waiter(&node_cell);
                }
            })
            .on_late_success(move |item| {
                if let Some(inner) = late.upgrade() {
                    inner.put(item);
                }
            })
            .arm(&self.scheduler, timeout, PoolError::WaiterTimeout);
        (waiter, Some(cell))
    }

    fn remove_expired_waiter(self: &Arc<Self>, node_cell: &Mutex<Option<NodeHandle>>) {
        let (removed, finish) = {
            let mut st = self.state.lock();
            let removed = node_cell.lock().take().and_then(|node| st.waiters.remove(node));
            let finish = if removed.is_some() {
                self.stats.increment_waiter_timed_out();
                self.check_shutdown_complete(&mut st)
            } else {
                None
            };
            (removed, finish)
        };
        // The expired waiter is already being completed by the deadline.
        drop(removed);
        debug!(pool = %self.name, "waiter timed out");
        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
    }

    fn cancel_waiter(self: &Arc<Self>, node: NodeHandle) -> bool {
        let (removed, finish) = {
            let mut st = self.state.lock();
            let removed = st.waiters.remove(node);
            let finish = if removed.is_some() {
                self.check_shutdown_complete(&mut st)
            } else {
                None
            };
            (removed, finish)
        };
        let cancelled = removed.is_some();
        drop(removed);
        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
        cancelled
    }

    fn put(self: &Arc<Self>, item: T) {
        {
            let mut st = self.state.lock();
            st.checked_out = st.checked_out.saturating_sub(1);
        }
        if !self.lifecycle.validate_put(&item) {
            debug!(pool = %self.name, "returned item failed validation");
            self.destroy(item, true);
            return;
        }
        self.rate_limiter.set_period(Duration::ZERO);
        self.add(item);
    }

    fn dispose(self: &Arc<Self>, item: T) {
        {
            let mut st = self.state.lock();
            st.checked_out = st.checked_out.saturating_sub(1);
        }
        self.destroy(item, true);
    }

    /// Hands `item` to the oldest waiter, or parks it as idle.
    fn add(self: &Arc<Self>, item: T) {
        let (waiter, finish) = {
            let mut st = self.state.lock();
            let waiter = st.waiters.pop_front();
            match waiter {
                Some(waiter) => {
                    st.checked_out += 1;
                    self.stats.sample_max_checked_out(st.checked_out);
                    (Some((waiter, item)), None)
                }
                None => {
                    st.idle.push_back(TimedItem::new(item));
                    (None, self.check_shutdown_complete(&mut st))
                }
            }
        };

        if let Some((waiter, item)) = waiter {
            waiter.on_success(item);
        }
        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
    }

    fn destroy(self: &Arc<Self>, item: T, bad: bool) {
        if bad {
            self.stats.increment_bad_destroyed();
        }
        trace!(pool = %self.name, bad, "destroying item");

        let weak = Arc::downgrade(self);
        self.lifecycle.destroy(
            item,
            bad,
            Callback::new(move |result| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(_) => inner.stats.increment_destroyed(),
                    Err(e) => {
                        inner.stats.increment_destroy_errors();
                        warn!(pool = %inner.name, error = %e, "item destruction failed");
                    }
                }
                inner.object_destroyed(1);
            }),
        );
    }

    /// Releases `count` slots and reacts to the freed capacity.
    fn object_destroyed(self: &Arc<Self>, count: usize) {
        let (create, finish) = {
            let mut st = self.state.lock();
            st.pool_size = st.pool_size.saturating_sub(count);
            (self.should_create(&mut st), self.check_shutdown_complete(&mut st))
        };
        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
        if create {
            self.create();
        }
    }

    /// Reserves a slot for a new item when a waiter or the minimum size
    /// needs one.
    fn should_create(&self, st: &mut ExclusiveState<T>) -> bool {
        if st.state != PoolState::Running || st.pool_size >= self.config.max_size {
            return false;
        }
        if st.waiters.is_empty() && st.pool_size >= self.config.min_size {
            return false;
        }
        st.pool_size += 1;
        self.stats.sample_max_pool_size(st.pool_size);
        true
    }

    fn create(self: &Arc<Self>) {
        trace!(pool = %self.name, "scheduling item creation");
        let weak = Arc::downgrade(self);
        self.rate_limiter.submit(Task::new(move |done| {
            if let Some(inner) = weak.upgrade() {
                inner.run_create(done);
            }
        }));
    }

    fn run_create(self: &Arc<Self>, done: TaskDone) {
        let ignored = {
            let mut st = self.state.lock();
            let available = st.checked_out + st.idle.len();
            if st.waiters.is_empty() && available >= self.config.min_size {
                st.pool_size = st.pool_size.saturating_sub(1);
                self.stats.increment_creation_ignored();
                Some(self.check_shutdown_complete(&mut st))
            } else {
                None
            }
        };
        if let Some(finish) = ignored {
            trace!(pool = %self.name, "creation no longer needed");
            if let Some(finish) = finish {
                self.finish_shutdown(finish);
            }
            done.done();
            return;
        }

        let weak = Arc::downgrade(self);
        let lifecycle = Arc::clone(&self.lifecycle);
        let callback = TimeoutCallback::new(Callback::new(move |result: PoolResult<T>| {
            if let Some(inner) = weak.upgrade() {
                match result {
                    Ok(item) => {
                        inner.stats.increment_created();
                        inner.add(item);
                    }
                    Err(e) => inner.creation_failed(e),
                }
            }
            done.done();
        }))
        .on_late_success(move |item| lifecycle.destroy(item, true, Callback::noop()))
        .arm(
            &self.scheduler,
            self.config.creation_timeout,
            PoolError::CreationTimeout,
        );

        self.lifecycle.create(callback);
    }

    /// Fails every waiter, drops queued creations and backs off.
    fn creation_failed(self: &Arc<Self>, error: PoolError) {
        let cancelled = self.rate_limiter.cancel_pending_tasks();
        let (denied, create, finish) = {
            let mut st = self.state.lock();
            self.stats.increment_create_errors();
            let denied = st.waiters.drain();
            st.pool_size = st.pool_size.saturating_sub(1 + cancelled.len());
            (
                denied,
                self.should_create(&mut st),
                self.check_shutdown_complete(&mut st),
            )
        };
        drop(cancelled);

        warn!(pool = %self.name, error = %error, denied = denied.len(), "item creation failed");
        for waiter in denied {
            waiter.on_error(error.clone());
        }
        self.rate_limiter.increment_period();

        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
        if create {
            self.create();
        }
    }

    fn cancel_waiters(self: &Arc<Self>) -> Vec<Callback<T>> {
        let (waiters, finish) = {
            let mut st = self.state.lock();
            let waiters = st.waiters.drain();
            (waiters, self.check_shutdown_complete(&mut st))
        };
        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
        waiters
    }

    /// Destroys items idle for longer than the idle timeout, oldest first,
    /// keeping at least `min_size` slots.
    fn timeout_objects(self: &Arc<Self>) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        let expired = {
            let mut st = self.state.lock();
            let now = Instant::now();
            let mut excess = st.pool_size.saturating_sub(self.config.min_size);
            let mut expired = Vec::new();
            while excess > 0
                && st
                    .idle
                    .front()
                    .is_some_and(|t| t.idle_longer_than(idle_timeout, now))
            {
                if let Some(timed) = st.idle.pop_front() {
                    expired.push(timed.item);
                    self.stats.increment_timed_out();
                }
                excess -= 1;
            }
            expired
        };

        if !expired.is_empty() {
            debug!(pool = %self.name, count = expired.len(), "destroying idle items");
        }
        for item in expired {
            self.destroy(item, false);
        }
    }

    fn shutdown(self: &Arc<Self>, callback: Callback<()>) {
        let rejected = {
            let mut st = self.state.lock();
            if st.state == PoolState::Running {
                st.state = PoolState::ShuttingDown;
                st.shutdown_callback = Some(callback);
                None
            } else {
                Some((callback, PoolError::illegal_state(&self.name, st.state)))
            }
        };
        if let Some((callback, error)) = rejected {
            callback.on_error(error);
            return;
        }

        info!(pool = %self.name, "shutdown requested");
        let finish = {
            let mut st = self.state.lock();
            self.check_shutdown_complete(&mut st)
        };
        if let Some(finish) = finish {
            self.finish_shutdown(finish);
        }
    }

    /// Moves to `Stopped` once nothing is waiting and every slot is idle.
    fn check_shutdown_complete(&self, st: &mut ExclusiveState<T>) -> Option<ShutdownFinish<T>> {
        if st.state != PoolState::ShuttingDown {
            return None;
        }
        if !st.waiters.is_empty() || st.idle.len() != st.pool_size {
            debug!(
                pool = %self.name,
                waiters = st.waiters.len(),
                outstanding = st.pool_size - st.idle.len().min(st.pool_size),
                "shutdown waiting for outstanding items"
            );
            return None;
        }

        st.state = PoolState::Stopped;
        let callback = st.shutdown_callback.take()?;
        Some(ShutdownFinish {
            callback,
            idle: st.idle.drain(..).map(|timed| timed.item).collect(),
            reaper: st.reaper.take(),
        })
    }

    fn finish_shutdown(self: &Arc<Self>, finish: ShutdownFinish<T>) {
        if let Some(reaper) = finish.reaper {
            reaper.cancel();
        }
        info!(pool = %self.name, destroyed = finish.idle.len(), "pool stopped");
        for item in finish.idle {
            self.destroy(item, false);
        }
        finish.callback.on_success(());
    }
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        if let Some(reaper) = self.state.lock().reaper.take() {
            reaper.cancel();
        }
    }
}
