//! Basic usage examples for ExclusivePool

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use transport_pool::{
    AsyncPool, Callback, ExclusivePool, Lifecycle, NoopRateLimiter, PoolConfiguration, PoolError,
    Scheduler, Strategy, recv,
};

/// Pretend connections, numbered in creation order.
#[derive(Default)]
struct Connections {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl Lifecycle<usize> for Connections {
    fn create(&self, callback: Callback<usize>) {
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        println!("   Opening connection {id}");
        callback.on_success(id);
    }

    fn validate_get(&self, _item: &usize) -> bool {
        true
    }

    fn validate_put(&self, _item: &usize) -> bool {
        true
    }

    fn destroy(&self, item: usize, error: bool, callback: Callback<usize>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        println!("   Closing connection {item} (error: {error})");
        callback.on_success(item);
    }
}

fn pool(config: PoolConfiguration) -> ExclusivePool<usize> {
    let pool = ExclusivePool::new(
        "demo",
        Arc::new(Connections::default()),
        config,
        Arc::new(NoopRateLimiter),
        Scheduler::current().unwrap(),
    )
    .unwrap();
    pool.start().unwrap();
    pool
}

#[tokio::main]
async fn main() {
    println!("=== transport_pool - Basic Examples ===\n");

    // Example 1: Callback API
    callback_api().await;

    // Example 2: Pool with configuration
    configured_pool().await;

    // Example 3: Waiters and cancellation
    waiters().await;

    // Example 4: Statistics
    statistics().await;
}

async fn callback_api() {
    println!("1. Callback API:");
    let pool = pool(PoolConfiguration::default());

    let (callback, rx) = Callback::channel();
    pool.get(callback);
    let connection = recv(rx).await.unwrap();
    println!("   Got connection: {connection}");

    pool.put(connection);
    println!("   Idle after return: {}\n", pool.get_stats().idle_count);
}

async fn configured_pool() {
    println!("2. Configured Pool:");

    let config = PoolConfiguration::new()
        .with_max_size(4)
        .with_min_size(2)
        .with_idle_timeout(Duration::from_secs(60))
        .with_strategy(Strategy::Lru);
    let pool = pool(config);
    println!("   Pre-warmed: {}", pool.get_stats().idle_count);

    let first = pool.get_async().await.unwrap();
    let second = pool.get_async().await.unwrap();
    println!("   Checked out: {first}, {second}");
    pool.put(first);
    pool.put(second);

    pool.shutdown_async().await.unwrap();
    println!("   Pool state after shutdown: {:?}\n", pool.state());
}

async fn waiters() {
    println!("3. Waiters:");
    let pool = pool(PoolConfiguration::new().with_max_size(1).with_max_waiters(1));

    let held = pool.get_async().await.unwrap();

    let (queued, queued_rx) = Callback::channel();
    let handle = pool.get(queued);
    println!("   Waiting requests: {}", pool.get_stats().waiter_count);

    let (rejected, rejected_rx) = Callback::<usize>::channel();
    pool.get(rejected);
    if let Err(PoolError::SizeLimitExceeded { max_waiters, .. }) = recv(rejected_rx).await {
        println!("   Rejected: more than {max_waiters} waiter");
    }

    println!("   Cancelled: {}", handle.cancel());
    println!("   Cancelled request sees: {:?}", recv(queued_rx).await);
    pool.put(held);
    println!();
}

async fn statistics() {
    println!("4. Statistics:");
    let pool = pool(PoolConfiguration::default());

    let a = pool.get_async().await.unwrap();
    let b = pool.get_async().await.unwrap();
    pool.put(a);
    pool.dispose(b);

    let stats = pool.get_stats();
    println!("   Created: {}", stats.total_created);
    println!("   Destroyed: {}", stats.total_destroyed);
    println!("   Pool size: {}", stats.pool_size);

    println!("\n   Exported:");
    let mut exported: Vec<_> = stats.export().into_iter().collect();
    exported.sort();
    for (key, value) in exported {
        println!("     {key}: {value}");
    }
}
