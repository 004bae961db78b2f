//! Deadline-bounded completion
//!
//! Both the real completion and the deadline race to take a single slot;
//! whoever takes it first owns the continuation, the loser is a no-op.
//! Cancelling the timer on completion is only an optimisation.

use crate::callback::Callback;
use crate::errors::{PoolError, PoolResult};
use crate::scheduler::{ScheduledTask, Scheduler};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Holds an item until it is either taken or the deadline fires.
pub struct SingleTimeout<I> {
    item: Arc<Mutex<Option<I>>>,
    timer: Arc<Mutex<Option<ScheduledTask>>>,
}

impl<I: Send + 'static> SingleTimeout<I> {
    /// Arms a deadline of `timeout`; if it wins, `on_timeout` receives the item.
    pub fn new<F>(scheduler: &Scheduler, timeout: Duration, item: I, on_timeout: F) -> Self
    where
        F: FnOnce(I) + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(item)));
        let timer = Arc::new(Mutex::new(None));

        let expired = Arc::clone(&slot);
        let task = scheduler.schedule(timeout, move || {
            let item = expired.lock().take();
            if let Some(item) = item {
                on_timeout(item);
            }
        });
        *timer.lock() = Some(task);

        Self { item: slot, timer }
    }

    /// Takes the item if the deadline has not fired yet.
    pub fn take(&self) -> Option<I> {
        let item = self.item.lock().take();
        if item.is_some()
            && let Some(task) = self.timer.lock().take()
        {
            task.cancel();
        }
        item
    }
}

impl<I> Clone for SingleTimeout<I> {
    fn clone(&self) -> Self {
        Self {
            item: Arc::clone(&self.item),
            timer: Arc::clone(&self.timer),
        }
    }
}

/// Disarms the deadline when the bounded callback is dropped unused, so a
/// cancelled request never sees a timeout error.
struct Disarm<I: Send + 'static>(SingleTimeout<I>);

impl<I: Send + 'static> Drop for Disarm<I> {
    fn drop(&mut self) {
        let _ = self.0.take();
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;
type LateHandler<T> = Box<dyn FnOnce(T) + Send>;

/// Wraps a callback so it completes exactly once: with the real result or
/// with the error produced when the deadline fires first.
///
/// # Examples
///
/// ```
/// use transport_pool::{Callback, PoolError, Scheduler, TimeoutCallback};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let scheduler = Scheduler::current().unwrap();
/// let (callback, rx) = Callback::<u32>::channel();
/// let bounded = TimeoutCallback::new(callback)
///     .arm(&scheduler, Duration::from_secs(5), PoolError::DeadlineExceeded);
///
/// bounded.on_success(1);
/// assert_eq!(transport_pool::recv(rx).await, Ok(1));
/// # }
/// ```
pub struct TimeoutCallback<T> {
    callback: Callback<T>,
    cleanups: Vec<Cleanup>,
    late: Option<LateHandler<T>>,
}

impl<T: Send + 'static> TimeoutCallback<T> {
    pub fn new(callback: Callback<T>) -> Self {
        Self {
            callback,
            cleanups: Vec::new(),
            late: None,
        }
    }

    /// Adds a task that runs when the deadline fires, before the callback
    /// receives the timeout error.
    pub fn on_timeout<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanups.push(Box::new(cleanup));
        self
    }

    /// Receives a successful result that arrives after the deadline fired.
    pub fn on_late_success<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.late = Some(Box::new(handler));
        self
    }

    /// Starts the deadline and returns the bounded callback.
    pub fn arm<E>(self, scheduler: &Scheduler, timeout: Duration, error: E) -> Callback<T>
    where
        E: FnOnce(Duration) -> PoolError + Send + 'static,
    {
        let Self {
            callback,
            cleanups,
            late,
        } = self;

        let timeout_slot = SingleTimeout::new(scheduler, timeout, callback, move |callback| {
            for cleanup in cleanups {
                cleanup();
            }
            callback.on_error(error(timeout));
        });

        let guard = Disarm(timeout_slot);
        Callback::new(move |result: PoolResult<T>| match guard.0.take() {
            Some(callback) => callback.complete(result),
            None => {
                if let (Ok(value), Some(late)) = (result, late) {
                    late(value);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;

    fn counting() -> (Callback<u32>, Arc<Mutex<Vec<PoolResult<u32>>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (Callback::new(move |r| sink.lock().push(r)), results)
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_deadline() {
        let scheduler = Scheduler::current().unwrap();
        let (callback, results) = counting();
        let bounded = TimeoutCallback::new(callback).arm(
            &scheduler,
            Duration::from_millis(100),
            PoolError::DeadlineExceeded,
        );

        bounded.on_success(5);
        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*results.lock(), vec![Ok(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_before_completion() {
        let scheduler = Scheduler::current().unwrap();
        let (callback, results) = counting();
        let cleaned = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(Mutex::new(None));

        let cleanup_counter = Arc::clone(&cleaned);
        let late_sink = Arc::clone(&late);
        let bounded = TimeoutCallback::new(callback)
            .on_timeout(move || {
                cleanup_counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_late_success(move |v| *late_sink.lock() = Some(v))
            .arm(&scheduler, Duration::from_millis(100), PoolError::DeadlineExceeded);

        time::sleep(Duration::from_millis(150)).await;
        bounded.on_success(9);

        assert_eq!(
            *results.lock(),
            vec![Err(PoolError::DeadlineExceeded(Duration::from_millis(100)))]
        );
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(*late.lock(), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_at_deadline_invokes_once() {
        let scheduler = Scheduler::current().unwrap();
        for offset in [99u64, 100, 101] {
            let (callback, results) = counting();
            let bounded = TimeoutCallback::new(callback).arm(
                &scheduler,
                Duration::from_millis(100),
                PoolError::DeadlineExceeded,
            );
            time::advance(Duration::from_millis(offset)).await;
            bounded.on_success(1);
            time::sleep(Duration::from_millis(10)).await;
            assert_eq!(results.lock().len(), 1, "offset {offset}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_callback_disarms_deadline() {
        let scheduler = Scheduler::current().unwrap();
        let (callback, results) = counting();
        let bounded = TimeoutCallback::new(callback).arm(
            &scheduler,
            Duration::from_millis(100),
            PoolError::DeadlineExceeded,
        );

        drop(bounded);
        time::sleep(Duration::from_millis(200)).await;
        assert!(results.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timeout_take() {
        let scheduler = Scheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timeout = SingleTimeout::new(&scheduler, Duration::from_millis(10), "item", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(timeout.take(), Some("item"));
        assert_eq!(timeout.take(), None);
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
