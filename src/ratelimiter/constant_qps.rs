use super::buffer::DispatchCallback;
use super::evicting::EvictingCircularBuffer;
use super::rate::Rate;
use super::smooth::{AsyncRateLimiter, BufferOverflowMode, SmoothRateLimiter, UnboundedExecutionTracker};
use crate::errors::{PoolError, PoolResult};
use crate::scheduler::{Executor, Scheduler};

use std::sync::Arc;
use std::time::Duration;

/// Dispatches callbacks at a constant rate regardless of how many arrive.
///
/// Submitted callbacks land in an [`EvictingCircularBuffer`] and are
/// replayed at the configured rate until they outlive the buffer TTL, so a
/// single submission can produce many dispatches and a burst of
/// submissions never exceeds the rate.
pub struct ConstantQpsRateLimiter {
    limiter: SmoothRateLimiter<EvictingCircularBuffer, UnboundedExecutionTracker>,
}

impl ConstantQpsRateLimiter {
    pub fn new(
        scheduler: Scheduler,
        executor: Arc<dyn Executor>,
        buffer: EvictingCircularBuffer,
        name: impl Into<String>,
    ) -> Self {
        Self {
            limiter: SmoothRateLimiter::with_parts(
                scheduler,
                executor,
                buffer,
                UnboundedExecutionTracker::default(),
                BufferOverflowMode::None,
                name,
            ),
        }
    }

    pub fn set_buffer_capacity(&self, capacity: usize) -> PoolResult<()> {
        self.limiter.buffer().set_capacity(capacity)
    }

    pub fn set_buffer_ttl(&self, ttl: Duration) {
        self.limiter.buffer().set_ttl(ttl)
    }

    /// Drops every buffered callback without dispatching it.
    pub fn clear(&self) {
        self.limiter.buffer().clear()
    }
}

impl AsyncRateLimiter for ConstantQpsRateLimiter {
    fn submit(&self, callback: DispatchCallback) -> PoolResult<()> {
        // A replaying buffer would keep failing the same callback until it
        // expires, so cancelled limiters fail submissions directly.
        if let Some(e) = self.limiter.invocation_error() {
            callback(Err(e));
            return Ok(());
        }
        self.limiter.submit(callback)
    }

    fn rate(&self) -> Rate {
        self.limiter.rate()
    }

    fn set_rate(&self, permits_per_period: f64, period: Duration, burst: usize) -> PoolResult<()> {
        self.limiter.set_rate(permits_per_period, period, burst)
    }

    fn cancel_all(&self, error: PoolError) {
        self.limiter.cancel_all(error)
    }

    fn pending_tasks_count(&self) -> usize {
        self.limiter.pending_tasks_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DirectExecutor;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{self, Instant};

    const ONE_SECOND: Duration = Duration::from_secs(1);

    fn limiter(capacity: usize, ttl: Duration) -> ConstantQpsRateLimiter {
        ConstantQpsRateLimiter::new(
            Scheduler::current().unwrap(),
            Arc::new(DirectExecutor),
            EvictingCircularBuffer::new(capacity, ttl).unwrap(),
            "constant",
        )
    }

    fn tattler() -> (DispatchCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        (
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_once_get_many() {
        let limiter = limiter(1, Duration::from_secs(3600));
        limiter.set_rate(5.0, ONE_SECOND, usize::MAX).unwrap();
        let (callback, count) = tattler();
        limiter.submit(callback).unwrap();

        time::sleep(ONE_SECOND * 10).await;
        assert!(count.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_fractional_rate() {
        let limiter = limiter(1, Duration::from_secs(3600));
        limiter.set_rate(0.05, ONE_SECOND, usize::MAX).unwrap();
        let (callback, count) = tattler();
        limiter.submit(callback).unwrap();

        // one dispatch every twenty seconds: at 0s, 20s and 40s
        time::sleep(Duration::from_millis(59_999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_stops_when_ttl_expires() {
        let limiter = limiter(4, ONE_SECOND - Duration::from_millis(1));
        limiter.set_rate(5.0, ONE_SECOND, usize::MAX).unwrap();
        let (callback, count) = tattler();
        limiter.submit(callback).unwrap();

        time::sleep(ONE_SECOND * 10).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_submissions_keeps_rate() {
        let limiter = limiter(100, Duration::from_secs(3600));
        limiter.set_rate(10.0, ONE_SECOND, usize::MAX).unwrap();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        for _ in 0..50 {
            let stamps = Arc::clone(&stamps);
            limiter
                .submit(Arc::new(move |_| stamps.lock().push(start.elapsed())))
                .unwrap();
        }

        time::sleep(Duration::from_millis(2_500)).await;
        let per_second = stamps
            .lock()
            .iter()
            .filter(|at| **at < ONE_SECOND)
            .count();
        assert_eq!(per_second, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_fails_new_submissions() {
        let limiter = limiter(4, Duration::from_secs(3600));
        limiter.cancel_all(PoolError::Cancelled);
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        limiter.submit(Arc::new(move |r| *sink.lock() = Some(r))).unwrap();

        assert_eq!(*result.lock(), Some(Err(PoolError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_fails_buffered_callback_once() {
        let limiter = limiter(4, Duration::from_secs(3600));
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        limiter.submit(Arc::new(move |r| sink.lock().push(r))).unwrap();

        limiter.cancel_all(PoolError::Cancelled);
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*results.lock(), vec![Err(PoolError::Cancelled)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_buffered_callbacks() {
        let limiter = limiter(4, Duration::from_secs(3600));
        let (callback, count) = tattler();
        limiter.submit(callback).unwrap();
        limiter.clear();

        limiter.set_rate(5.0, ONE_SECOND, usize::MAX).unwrap();
        time::sleep(ONE_SECOND * 3).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.limiter.buffer().capacity(), 4);
    }
}
