use super::{AsyncPool, PoolState, PutBack, TimedItem, await_shutdown, checkout};
use crate::callback::{Callback, Cancellable};
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::lifecycle::Lifecycle;
use crate::linked_deque::{LinkedDeque, NodeHandle};
use crate::metrics::{PoolGauges, PoolStats, PoolStatsTracker};
use crate::ratelimiter::{RateLimiter, Task};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::timeout::TimeoutCallback;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Identity of a shared item: the address of its allocation.
fn key<T>(item: &Arc<T>) -> usize {
    Arc::as_ptr(item) as *const () as usize
}

struct SharedState<T> {
    state: PoolState,
    active: Option<TimedItem<Arc<T>>>,
    /// Borrowers of the active item.
    checked_out: usize,
    /// Retired items still lent out, with their outstanding borrow counts.
    disposed: HashMap<usize, (Arc<T>, usize)>,
    destroy_in_progress: HashSet<usize>,
    waiters: LinkedDeque<Callback<Arc<T>>>,
    create_in_progress: bool,
    shutdown_callback: Option<Callback<()>>,
    reaper: Option<ScheduledTask>,
}

struct SharedInner<T> {
    name: String,
    config: PoolConfiguration,
    lifecycle: Arc<dyn Lifecycle<Arc<T>>>,
    rate_limiter: Arc<dyn RateLimiter>,
    scheduler: Scheduler,
    state: Arc<Mutex<SharedState<T>>>,
    stats: Arc<PoolStatsTracker>,
}

/// A pool holding at most one item, lent to any number of borrowers at once.
///
/// Fits multiplexed resources such as a pipelined connection. Borrowers get
/// clones of the same `Arc`; the item is retired when any borrower disposes
/// it, and destroyed only after every outstanding borrow has been returned.
/// `max_size`, `min_size` and `strategy` of the configuration do not apply.
pub struct SharedPool<T> {
    inner: Arc<SharedInner<T>>,
}

impl<T: Send + Sync + 'static> SharedPool<T> {
    pub fn new(
        name: impl Into<String>,
        lifecycle: Arc<dyn Lifecycle<Arc<T>>>,
        config: PoolConfiguration,
        rate_limiter: Arc<dyn RateLimiter>,
        scheduler: Scheduler,
    ) -> PoolResult<Self> {
        config.validate()?;

        let state = Arc::new(Mutex::new(SharedState {
            state: PoolState::NotStarted,
            active: None,
            checked_out: 0,
            disposed: HashMap::new(),
            destroy_in_progress: HashSet::new(),
            waiters: LinkedDeque::new(),
            create_in_progress: false,
            shutdown_callback: None,
            reaper: None,
        }));

        let gauge_state = Arc::clone(&state);
        let stats = Arc::new(PoolStatsTracker::new(move || {
            let st = gauge_state.lock();
            let present = usize::from(st.active.is_some());
            PoolGauges {
                max_size: 1,
                min_size: 0,
                pool_size: present,
                checked_out: st.checked_out,
                idle_count: if st.checked_out == 0 { present } else { 0 },
                waiter_count: st.waiters.len(),
            }
        }));

        Ok(Self {
            inner: Arc::new(SharedInner {
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

    /// Number of retired items still lent out.
    pub fn disposed_count(&self) -> usize {
        self.inner.state.lock().disposed.len()
    }

    /// Awaits the shared item. Dropping the future withdraws the request.
    pub async fn get_async(&self) -> PoolResult<Arc<T>> {
        let weak = Arc::downgrade(&self.inner);
        let put_back: PutBack<Arc<T>> = Arc::new(move |item| {
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

impl<T: Send + Sync + 'static> AsyncPool<Arc<T>> for SharedPool<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self) -> PoolResult<()> {
        self.inner.start()
    }

    fn shutdown(&self, callback: Callback<()>) {
        self.inner.shutdown(callback)
    }

    fn get(&self, callback: Callback<Arc<T>>) -> Cancellable {
        self.inner.get(callback)
    }

    fn put(&self, item: Arc<T>) {
        self.inner.put(item)
    }

    fn dispose(&self, item: Arc<T>) {
        self.inner.dispose(item)
    }

    fn cancel_waiters(&self) -> Vec<Callback<Arc<T>>> {
        self.inner.state.lock().waiters.drain()
    }

    fn get_stats(&self) -> PoolStats {
        self.inner.stats.get_stats()
    }
}

impl<T: Send + Sync + 'static> SharedInner<T> {
    fn start(self: &Arc<Self>) -> PoolResult<()> {
        let mut st = self.state.lock();
        if st.state != PoolState::NotStarted {
            return Err(PoolError::illegal_state(&self.name, st.state));
        }
        st.state = PoolState::Running;
        if let Some(period) = self.config.reap_period() {
            let weak = Arc::downgrade(self);
            st.reaper = Some(self.scheduler.schedule_at_fixed_rate(period, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.reap();
                }
            }));
        }
        drop(st);

        info!(pool = %self.name, "shared pool started");
        Ok(())
    }

    fn get(self: &Arc<Self>, callback: Callback<Arc<T>>) -> Cancellable {
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

            let Some(item) = st.active.as_ref().map(|timed| Arc::clone(&timed.item)) else {
                let Some(callback) = callback.take() else {
                    return Cancellable::resolved();
                };
                if st.waiters.len() >= self.config.max_waiters {
                    drop(st);
                    callback.on_error(PoolError::SizeLimitExceeded {
                        pool: self.name.clone(),
                        max_waiters: self.config.max_waiters,
                    });
                    return Cancellable::resolved();
                }
                let node = st.waiters.push_back(callback);
                let create = !st.create_in_progress;
                st.create_in_progress = true;
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
            st.checked_out += 1;
            self.stats.sample_max_checked_out(st.checked_out);
            drop(st);

            if self.lifecycle.validate_get(&item) {
                if let Some(callback) = callback.take() {
                    callback.on_success(item);
                }
                return Cancellable::resolved();
            }

            debug!(pool = %self.name, "shared item failed validation");
            let destroy = {
                let mut st = self.state.lock();
                self.retire(&mut st, &item)
            };
            if destroy {
                self.destroy(item, true);
            }
        }
    }

    fn cancel_waiter(&self, node: NodeHandle) -> bool {
        let removed = self.state.lock().waiters.remove(node);
        removed.is_some()
    }

    fn is_active(st: &SharedState<T>, item: &Arc<T>) -> bool {
        st.active
            .as_ref()
            .is_some_and(|timed| Arc::ptr_eq(&timed.item, item))
    }

    fn put(self: &Arc<Self>, item: Arc<T>) {
        if !Self::is_active(&self.state.lock(), &item) {
            trace!(pool = %self.name, "returning a retired item");
            self.dispose(item);
            return;
        }
        if !self.lifecycle.validate_put(&item) {
            debug!(pool = %self.name, "returned item failed validation");
            self.dispose(item);
            return;
        }
        self.rate_limiter.set_period(Duration::ZERO);

        let (returned, destroy) = {
            let mut st = self.state.lock();
            if Self::is_active(&st, &item) {
                if st.checked_out == 0 {
                    warn!(pool = %self.name, "item returned more often than it was lent");
                }
                st.checked_out = st.checked_out.saturating_sub(1);
                (st.checked_out == 0, false)
            } else {
                // Retired while validating.
                (false, self.retire(&mut st, &item))
            }
        };
        if destroy {
            self.destroy(item, true);
        }
        if returned {
            self.attempt_shutdown();
        }
    }

    fn dispose(self: &Arc<Self>, item: Arc<T>) {
        let destroy = {
            let mut st = self.state.lock();
            self.retire(&mut st, &item)
        };
        if destroy {
            self.destroy(item, true);
        } else {
            self.attempt_shutdown();
        }
    }

    /// Drops one borrow of `item`, retiring it first if it is still active.
    /// Returns `true` when the caller must destroy it.
    fn retire(&self, st: &mut SharedState<T>, item: &Arc<T>) -> bool {
        let id = key(item);
        if Self::is_active(st, item) {
            st.active = None;
            let borrows = std::mem::take(&mut st.checked_out);
            st.disposed.insert(id, (Arc::clone(item), borrows));
        }

        let Some((_, borrows)) = st.disposed.get_mut(&id) else {
            warn!(pool = %self.name, "disposing an item this pool does not track");
            return false;
        };
        *borrows = borrows.saturating_sub(1);
        if *borrows > 0 {
            return false;
        }
        st.disposed.remove(&id);
        st.destroy_in_progress.insert(id)
    }

    fn destroy(self: &Arc<Self>, item: Arc<T>, bad: bool) {
        if bad {
            self.stats.increment_bad_destroyed();
        }
        trace!(pool = %self.name, bad, "destroying shared item");

        let id = key(&item);
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
                        warn!(pool = %inner.name, error = %e, "shared item destruction failed");
                    }
                }
                inner.state.lock().destroy_in_progress.remove(&id);
                inner.attempt_shutdown();
            }),
        );
    }

    fn create(self: &Arc<Self>) {
        trace!(pool = %self.name, "scheduling shared item creation");
        let weak = Arc::downgrade(self);
        self.rate_limiter.submit(Task::new(move |done| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let created = Arc::downgrade(&inner);
            let lifecycle = Arc::clone(&inner.lifecycle);
            let callback = TimeoutCallback::new(Callback::new(move |result| {
                if let Some(inner) = created.upgrade() {
                    inner.created(result);
                }
                done.done();
            }))
            .on_late_success(move |item| lifecycle.destroy(item, true, Callback::noop()))
            .arm(
                &inner.scheduler,
                inner.config.creation_timeout,
                PoolError::CreationTimeout,
            );
            inner.lifecycle.create(callback);
        }));
    }

    fn created(self: &Arc<Self>, result: PoolResult<Arc<T>>) {
        let item = match result {
            Ok(item) => item,
            Err(e) => return self.creation_failed(e),
        };

        let (waiters, rejected) = {
            let mut st = self.state.lock();
            self.stats.increment_created();
            st.create_in_progress = false;
            let waiters = st.waiters.drain();
            if st.state == PoolState::Stopped {
                (waiters, Some(PoolError::illegal_state(&self.name, st.state)))
            } else {
                st.checked_out += waiters.len();
                self.stats.sample_max_checked_out(st.checked_out);
                self.stats.sample_max_pool_size(1);
                st.active = Some(TimedItem::new(Arc::clone(&item)));
                (waiters, None)
            }
        };

        if let Some(error) = rejected {
            for waiter in waiters {
                waiter.on_error(error.clone());
            }
            self.destroy(item, false);
            return;
        }
        trace!(pool = %self.name, waiters = waiters.len(), "shared item created");
        for waiter in waiters {
            waiter.on_success(Arc::clone(&item));
        }
    }

    fn creation_failed(self: &Arc<Self>, error: PoolError) {
        self.rate_limiter.increment_period();
        drop(self.rate_limiter.cancel_pending_tasks());
        let denied = {
            let mut st = self.state.lock();
            self.stats.increment_create_errors();
            st.create_in_progress = false;
            st.waiters.drain()
        };

        warn!(pool = %self.name, error = %error, denied = denied.len(), "shared item creation failed");
        for waiter in denied {
            waiter.on_error(error.clone());
        }
    }

    /// Destroys the active item once it has been idle past the idle timeout.
    /// A borrowed item has its idle clock restarted instead.
    fn reap(self: &Arc<Self>) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        let expired = {
            let mut st = self.state.lock();
            let borrowed = st.checked_out > 0;
            match st.active.as_mut() {
                Some(timed) if borrowed => {
                    timed.renew();
                    None
                }
                Some(timed) if timed.idle_longer_than(idle_timeout, Instant::now()) => {
                    self.stats.increment_timed_out();
                    st.active.take()
                }
                _ => None,
            }
        };

        if let Some(timed) = expired {
            debug!(pool = %self.name, "destroying idle shared item");
            self.destroy(timed.item, false);
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
        self.attempt_shutdown();
    }

    /// Completes shutdown once no borrow of any item is outstanding.
    fn attempt_shutdown(self: &Arc<Self>) {
        let finish = {
            let mut st = self.state.lock();
            if st.state != PoolState::ShuttingDown {
                return;
            }
            if st.checked_out > 0 || !st.disposed.is_empty() {
                debug!(
                    pool = %self.name,
                    checked_out = st.checked_out,
                    retired = st.disposed.len(),
                    "shutdown waiting for outstanding borrows"
                );
                return;
            }
            st.state = PoolState::Stopped;
            (
                st.shutdown_callback.take(),
                st.reaper.take(),
                st.active.take(),
            )
        };

        let (callback, reaper, active) = finish;
        if let Some(reaper) = reaper {
            reaper.cancel();
        }
        info!(pool = %self.name, "shared pool stopped");
        if let Some(timed) = active {
            self.destroy(timed.item, false);
        }
        if let Some(callback) = callback {
            callback.on_success(());
        }
    }
}

impl<T> Drop for SharedInner<T> {
    fn drop(&mut self) {
        if let Some(reaper) = self.state.lock().reaper.take() {
            reaper.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::recv;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time;

    struct Conn {
        id: usize,
    }

    #[derive(Default)]
    struct Connections {
        next: AtomicUsize,
        creates: AtomicUsize,
        fail: AtomicBool,
        hold: Mutex<Vec<Callback<Arc<Conn>>>>,
        holding: AtomicBool,
        invalid: Mutex<HashSet<usize>>,
        destroyed: Mutex<Vec<(usize, bool)>>,
    }

    impl Lifecycle<Arc<Conn>> for Connections {
        fn create(&self, callback: Callback<Arc<Conn>>) {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                callback.on_error(PoolError::CreationFailed("connect refused".to_string()));
            } else if self.holding.load(Ordering::SeqCst) {
                self.hold.lock().push(callback);
            } else {
                let id = self.next.fetch_add(1, Ordering::SeqCst);
                callback.on_success(Arc::new(Conn { id }));
            }
        }

        fn validate_get(&self, item: &Arc<Conn>) -> bool {
            !self.invalid.lock().contains(&item.id)
        }

        fn validate_put(&self, item: &Arc<Conn>) -> bool {
            !self.invalid.lock().contains(&item.id)
        }

        fn destroy(&self, item: Arc<Conn>, error: bool, callback: Callback<Arc<Conn>>) {
            self.destroyed.lock().push((item.id, error));
            callback.on_success(item);
        }
    }

    impl Connections {
        fn release(&self) {
            self.holding.store(false, Ordering::SeqCst);
            let held = std::mem::take(&mut *self.hold.lock());
            for callback in held {
                let id = self.next.fetch_add(1, Ordering::SeqCst);
                callback.on_success(Arc::new(Conn { id }));
            }
        }
    }

    fn pool(lifecycle: Arc<Connections>, config: PoolConfiguration) -> SharedPool<Conn> {
        let pool = SharedPool::new(
            "shared",
            lifecycle,
            config,
            Arc::new(crate::ratelimiter::NoopRateLimiter),
            Scheduler::current().unwrap(),
        )
        .unwrap();
        pool.start().unwrap();
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_creation_serves_all_waiters() {
        let lifecycle = Arc::new(Connections {
            holding: AtomicBool::new(true),
            ..Default::default()
        });
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (callback, rx) = Callback::channel();
            pool.get(callback);
            receivers.push(rx);
        }
        assert_eq!(lifecycle.creates.load(Ordering::SeqCst), 1);

        lifecycle.release();
        for rx in receivers {
            assert_eq!(recv(rx).await.unwrap().id, 0);
        }
        assert_eq!(pool.get_stats().checked_out, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_limit_while_creating() {
        let lifecycle = Arc::new(Connections {
            holding: AtomicBool::new(true),
            ..Default::default()
        });
        let pool = pool(
            Arc::clone(&lifecycle),
            PoolConfiguration::default().with_max_waiters(1),
        );

        let (first, _first_rx) = Callback::channel();
        pool.get(first);
        let (second, second_rx) = Callback::channel();
        pool.get(second);

        assert!(matches!(
            recv(second_rx).await,
            Err(PoolError::SizeLimitExceeded { max_waiters: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrowers_share_one_item() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let a = pool.get_async().await.unwrap();
        let b = pool.get_async().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.get_stats().checked_out, 2);

        pool.put(a);
        pool.put(b);
        let stats = pool.get_stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.idle_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_waits_for_every_borrow() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let borrows: Vec<_> = vec![
            pool.get_async().await.unwrap(),
            pool.get_async().await.unwrap(),
            pool.get_async().await.unwrap(),
        ];
        let mut borrows = borrows.into_iter();
        if let Some(first) = borrows.next() {
            pool.dispose(first);
        }
        assert_eq!(pool.disposed_count(), 1);
        assert!(lifecycle.destroyed.lock().is_empty());

        // A new borrower gets a fresh item while the old one drains.
        let fresh = pool.get_async().await.unwrap();
        assert_eq!(fresh.id, 1);

        for stale in borrows {
            pool.put(stale);
        }
        assert_eq!(pool.disposed_count(), 0);
        assert_eq!(*lifecycle.destroyed.lock(), vec![(0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_item_is_ignored() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        pool.dispose(Arc::new(Conn { id: 99 }));
        assert!(lifecycle.destroyed.lock().is_empty());
        assert_eq!(pool.get_stats().total_bad_destroyed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_on_get_retires_item() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let first = pool.get_async().await.unwrap();
        pool.put(first);
        lifecycle.invalid.lock().insert(0);

        let second = pool.get_async().await.unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(*lifecycle.destroyed.lock(), vec![(0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failure_fails_waiters() {
        let lifecycle = Arc::new(Connections::default());
        lifecycle.fail.store(true, Ordering::SeqCst);
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let (callback, rx) = Callback::channel();
        pool.get(callback);
        assert!(matches!(recv(rx).await, Err(PoolError::CreationFailed(_))));
        assert_eq!(pool.get_stats().total_create_errors, 1);

        lifecycle.fail.store(false, Ordering::SeqCst);
        assert_eq!(pool.get_async().await.unwrap().id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_item_reaped_and_borrowed_item_renewed() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(
            Arc::clone(&lifecycle),
            PoolConfiguration::default().with_idle_timeout(Duration::from_millis(100)),
        );

        let item = pool.get_async().await.unwrap();
        time::sleep(Duration::from_millis(500)).await;
        assert!(lifecycle.destroyed.lock().is_empty());

        pool.put(item);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*lifecycle.destroyed.lock(), vec![(0, false)]);
        assert_eq!(pool.get_stats().total_timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_retired_borrows() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let a = pool.get_async().await.unwrap();
        let b = pool.get_async().await.unwrap();
        pool.dispose(a);

        let (callback, mut rx) = Callback::channel();
        pool.shutdown(callback);
        assert!(rx.try_recv().is_err());

        pool.put(b);
        assert_eq!(recv(rx).await, Ok(()));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(*lifecycle.destroyed.lock(), vec![(0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_destroys_idle_item() {
        let lifecycle = Arc::new(Connections::default());
        let pool = pool(Arc::clone(&lifecycle), PoolConfiguration::default());

        let item = pool.get_async().await.unwrap();
        pool.put(item);
        pool.shutdown_async().await.unwrap();

        assert_eq!(*lifecycle.destroyed.lock(), vec![(0, false)]);
        assert!(matches!(
            pool.get_async().await,
            Err(PoolError::IllegalState(_))
        ));
    }
}
