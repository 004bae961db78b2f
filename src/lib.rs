//! # transport_pool
//!
//! Asynchronous resource pooling and admission control for RPC transports.
//!
//! ## Features
//!
//! - Exclusive pools (one borrower per item) and shared pools (one item
//!   multiplexed across all borrowers)
//! - Callback-based `get`/`put`/`dispose` that never block, plus `async`
//!   conveniences
//! - Creation paced by an exponential back-off rate limiter
//! - Smooth and constant-QPS rate limiters for request admission
//! - Deadline-bounded callbacks that complete exactly once
//! - Idle reaping, minimum size pre-warming, waiter limits and timeouts
//! - Pool statistics with wait time percentiles and Prometheus export
//! - A keyed manager owning one pool per remote address
//!
//! ## Quick Start
//!
//! ```rust
//! use transport_pool::{
//!     AsyncPool, Callback, ExclusivePool, Lifecycle, NoopRateLimiter, PoolConfiguration, Scheduler,
//! };
//! use std::sync::Arc;
//!
//! struct Channels;
//!
//! impl Lifecycle<String> for Channels {
//!     fn create(&self, callback: Callback<String>) {
//!         callback.on_success("channel".to_string());
//!     }
//!     fn validate_get(&self, _item: &String) -> bool {
//!         true
//!     }
//!     fn validate_put(&self, _item: &String) -> bool {
//!         true
//!     }
//!     fn destroy(&self, item: String, _error: bool, callback: Callback<String>) {
//!         callback.on_success(item);
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = ExclusivePool::new(
//!     "backend:443",
//!     Arc::new(Channels),
//!     PoolConfiguration::default(),
//!     Arc::new(NoopRateLimiter),
//!     Scheduler::current().unwrap(),
//! )
//! .unwrap();
//! pool.start().unwrap();
//!
//! let channel = pool.get_async().await.unwrap();
//! println!("Got: {channel}");
//! pool.put(channel);
//! # }
//! ```

mod callback;
mod config;
mod errors;
mod lifecycle;
mod linked_deque;
mod manager;
mod metrics;
mod pool;
mod ratelimiter;
mod scheduler;
mod timeout;

pub use callback::{Callback, Cancellable, MultiCallback, recv};
pub use config::{PoolConfiguration, RateLimiterConfiguration, Strategy};
pub use errors::{PoolError, PoolResult};
pub use lifecycle::{AsyncLifecycle, AsyncLifecycleAdapter, Lifecycle};
pub use manager::{PoolFactory, PoolManager, SharedAsyncPool};
pub use metrics::{MetricsExporter, PoolGauges, PoolStats, PoolStatsTracker};
pub use pool::{AsyncPool, ExclusivePool, PoolState, SharedPool};
pub use ratelimiter::{
    AsyncRateLimiter, BoundedExecutionTracker, BufferOverflowMode, CallbackBuffer,
    ConstantQpsRateLimiter, DispatchCallback, EvictingCircularBuffer,
    ExponentialBackOffRateLimiter, ExecutionTracker, NoopRateLimiter, Rate, RateLimiter,
    SimpleCallbackBuffer, SmoothRateLimiter, Task, TaskDone, UnboundedExecutionTracker,
};
pub use scheduler::{DirectExecutor, Executor, ScheduledTask, Scheduler};
pub use timeout::{SingleTimeout, TimeoutCallback};
