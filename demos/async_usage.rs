//! Async usage examples

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use transport_pool::{
    AsyncLifecycle, AsyncLifecycleAdapter, AsyncPool, AsyncRateLimiter, DirectExecutor,
    ExclusivePool, ExponentialBackOffRateLimiter, Lifecycle, PoolConfiguration, PoolManager,
    PoolResult, RateLimiterConfiguration, Scheduler, SharedAsyncPool, SharedPool,
    SmoothRateLimiter, BufferOverflowMode,
};

/// A stand-in for a multiplexed channel.
struct Channel {
    id: usize,
}

#[derive(Default)]
struct Channels {
    next: AtomicUsize,
}

#[async_trait]
impl AsyncLifecycle<Arc<Channel>> for Channels {
    async fn create(&self) -> PoolResult<Arc<Channel>> {
        sleep(Duration::from_millis(20)).await;
        Ok(Arc::new(Channel {
            id: self.next.fetch_add(1, Ordering::SeqCst),
        }))
    }

    fn validate_get(&self, _item: &Arc<Channel>) -> bool {
        true
    }

    fn validate_put(&self, _item: &Arc<Channel>) -> bool {
        true
    }

    async fn destroy(&self, item: Arc<Channel>, _error: bool) -> PoolResult<Arc<Channel>> {
        Ok(item)
    }
}

#[async_trait]
impl AsyncLifecycle<usize> for Channels {
    async fn create(&self) -> PoolResult<usize> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn validate_get(&self, _item: &usize) -> bool {
        true
    }

    fn validate_put(&self, _item: &usize) -> bool {
        true
    }

    async fn destroy(&self, item: usize, _error: bool) -> PoolResult<usize> {
        Ok(item)
    }
}

#[tokio::main]
async fn main() {
    println!("=== transport_pool - Async Examples ===\n");

    // Example 1: Shared pool over an async lifecycle
    shared_pool().await;

    // Example 2: Creation with back-off
    backoff().await;

    // Example 3: Smooth request admission
    smooth_admission().await;

    // Example 4: One pool per address
    manager().await;
}

async fn shared_pool() {
    println!("1. Shared Pool:");
    let scheduler = Scheduler::current().unwrap();
    let lifecycle: Arc<dyn Lifecycle<Arc<Channel>>> =
        Arc::new(AsyncLifecycleAdapter::new(Channels::default(), scheduler.clone()));
    let pool = SharedPool::new(
        "multiplexed",
        lifecycle,
        PoolConfiguration::default(),
        Arc::new(transport_pool::NoopRateLimiter),
        scheduler,
    )
    .unwrap();
    pool.start().unwrap();

    let (a, b) = tokio::join!(pool.get_async(), pool.get_async());
    let (a, b) = (a.unwrap(), b.unwrap());
    println!("   Both borrowers share channel {} and {}", a.id, b.id);
    println!("   Checked out: {}", pool.get_stats().checked_out);
    pool.put(a);
    pool.put(b);
    pool.shutdown_async().await.unwrap();
    println!();
}

async fn backoff() {
    println!("2. Creation with Back-off:");
    let scheduler = Scheduler::current().unwrap();
    let limiter = ExponentialBackOffRateLimiter::new(
        RateLimiterConfiguration::new()
            .with_period_bounds(Duration::ZERO, Duration::from_secs(1))
            .with_initial_increment(Duration::from_millis(50)),
        scheduler.clone(),
    )
    .unwrap();
    let lifecycle: Arc<dyn Lifecycle<usize>> =
        Arc::new(AsyncLifecycleAdapter::new(Channels::default(), scheduler.clone()));
    let pool = ExclusivePool::new(
        "backoff",
        lifecycle,
        PoolConfiguration::default(),
        Arc::new(limiter.clone()),
        scheduler,
    )
    .unwrap();
    pool.start().unwrap();

    let item = pool.get_async().await.unwrap();
    println!("   Created {item}, limiter period: {:?}", limiter.period());
    pool.put(item);
    println!();
}

async fn smooth_admission() {
    println!("3. Smooth Admission:");
    let limiter = SmoothRateLimiter::new(
        Scheduler::current().unwrap(),
        Arc::new(DirectExecutor),
        16,
        BufferOverflowMode::Drop,
        "requests",
    );
    limiter.set_rate(5.0, Duration::from_secs(1), 1).unwrap();

    let dispatched = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let dispatched = Arc::clone(&dispatched);
        limiter
            .submit(Arc::new(move |_| {
                dispatched.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }
    sleep(Duration::from_millis(1100)).await;
    println!(
        "   Dispatched {} of 10 after one second, {} pending",
        dispatched.load(Ordering::SeqCst),
        limiter.pending_tasks_count()
    );
    println!();
}

async fn manager() {
    println!("4. Pool Manager:");
    let scheduler = Scheduler::current().unwrap();
    let manager = PoolManager::new(
        "hosts",
        move |address: &String| -> PoolResult<SharedAsyncPool<usize>> {
            let lifecycle: Arc<dyn Lifecycle<usize>> =
                Arc::new(AsyncLifecycleAdapter::new(Channels::default(), scheduler.clone()));
            let pool = ExclusivePool::new(
                address.clone(),
                lifecycle,
                PoolConfiguration::default(),
                Arc::new(transport_pool::NoopRateLimiter),
                scheduler.clone(),
            )?;
            Ok(Arc::new(pool))
        },
    );

    for address in ["a.example:443", "b.example:443", "a.example:443"] {
        let pool = manager.get_pool_for_address(&address.to_string()).unwrap();
        let (callback, rx) = transport_pool::Callback::channel();
        pool.get(callback);
        let item = transport_pool::recv(rx).await.unwrap();
        pool.put(item);
    }
    println!("   Pools: {}", manager.pool_count());
    for (name, stats) in manager.get_pool_stats() {
        println!("   {name}: created {}", stats.total_created);
    }
    manager.shutdown_async().await.unwrap();
}
