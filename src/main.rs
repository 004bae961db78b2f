// transport_pool
// Asynchronous resource pooling and admission control for RPC transports

// This is just a binary wrapper - the actual library is in lib.rs
// Run demos with: cargo run --example basic

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use transport_pool::{
    AsyncPool, Callback, ExclusivePool, Lifecycle, MetricsExporter, NoopRateLimiter,
    PoolConfiguration, Scheduler,
};

struct Connections {
    opened: AtomicUsize,
}

impl Lifecycle<usize> for Connections {
    fn create(&self, callback: Callback<usize>) {
        callback.on_success(self.opened.fetch_add(1, Ordering::SeqCst));
    }

    fn validate_get(&self, _item: &usize) -> bool {
        true
    }

    fn validate_put(&self, _item: &usize) -> bool {
        true
    }

    fn destroy(&self, item: usize, _error: bool, callback: Callback<usize>) {
        callback.on_success(item);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== transport_pool ===");
    println!("See demos/ directory for usage examples");
    println!("Run: cargo run --example basic");
    println!();

    println!("Quick Demo:");
    let pool = ExclusivePool::new(
        "localhost:8080",
        Arc::new(Connections {
            opened: AtomicUsize::new(0),
        }),
        PoolConfiguration::default().with_max_size(4),
        Arc::new(NoopRateLimiter),
        Scheduler::current()?,
    )?;
    pool.start()?;

    let connection = pool.get_async().await?;
    println!("  Got connection: {connection}");
    pool.put(connection);

    let stats = pool.get_stats();
    println!("  Idle after return: {}", stats.idle_count);
    println!();
    print!("{}", MetricsExporter::export_prometheus(&stats, pool.name(), None));

    pool.shutdown_async().await?;
    Ok(())
}
