//! Callback-based pools of costly resources
//!
//! Two flavours share one contract: [`ExclusivePool`] hands each item to one
//! borrower at a time, [`SharedPool`] multiplexes a single item across every
//! borrower. Neither blocks the caller: `get` either completes its callback
//! synchronously or parks the callback as a waiter.

mod exclusive;
mod shared;

pub use exclusive::ExclusivePool;
pub use shared::SharedPool;

use crate::callback::{Callback, Cancellable};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::PoolStats;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolState {
    #[default]
    NotStarted,
    Running,
    ShuttingDown,
    Stopped,
}

/// Asynchronous pool of `T`.
///
/// Every operation that completes a caller continuation does so after the
/// pool's internal lock has been released.
pub trait AsyncPool<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Moves the pool to `Running`. Fails when called more than once.
    fn start(&self) -> PoolResult<()>;

    /// Stops accepting new requests; `callback` fires once every outstanding
    /// item has come back.
    fn shutdown(&self, callback: Callback<()>);

    /// Requests an item. The returned handle removes the request if it is
    /// still waiting.
    fn get(&self, callback: Callback<T>) -> Cancellable;

    /// Returns a healthy item.
    fn put(&self, item: T);

    /// Returns a broken item, which is destroyed.
    fn dispose(&self, item: T);

    /// Removes every waiter without completing it. The caller owns the
    /// returned callbacks.
    fn cancel_waiters(&self) -> Vec<Callback<T>>;

    fn get_stats(&self) -> PoolStats;
}

/// An item with the instant it last became idle.
pub(crate) struct TimedItem<T> {
    pub(crate) item: T,
    pub(crate) timestamp: Instant,
}

impl<T> TimedItem<T> {
    pub(crate) fn new(item: T) -> Self {
        Self {
            item,
            timestamp: Instant::now(),
        }
    }

    pub(crate) fn renew(&mut self) {
        self.timestamp = Instant::now();
    }

    pub(crate) fn idle_longer_than(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) > timeout
    }
}

pub(crate) type PutBack<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Removes the pending request and recovers an item that was delivered but
/// never received when a checkout future is dropped.
struct PendingCheckout<T> {
    cancellable: Cancellable,
    rx: Option<oneshot::Receiver<PoolResult<T>>>,
    put_back: PutBack<T>,
}

impl<T> Drop for PendingCheckout<T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            self.cancellable.cancel();
            rx.close();
            if let Ok(Ok(item)) = rx.try_recv() {
                (self.put_back)(item);
            }
        }
    }
}

/// Drives a callback `get` as a future. Dropping the future gives the item
/// back through `put_back` rather than leaking it.
pub(crate) async fn checkout<T, G>(get: G, put_back: PutBack<T>) -> PoolResult<T>
where
    T: Send + 'static,
    G: FnOnce(Callback<T>) -> Cancellable,
{
    let (tx, rx) = oneshot::channel();
    let returned = Arc::clone(&put_back);
    let callback = Callback::new(move |result: PoolResult<T>| {
        if let Err(Ok(item)) = tx.send(result) {
            returned(item);
        }
    });

    let mut pending = PendingCheckout {
        cancellable: get(callback),
        rx: Some(rx),
        put_back,
    };
    let result = match pending.rx.as_mut() {
        Some(rx) => rx.await.unwrap_or(Err(PoolError::Cancelled)),
        None => Err(PoolError::Cancelled),
    };
    pending.rx = None;
    result
}

/// Drives a callback `shutdown` as a future.
pub(crate) async fn await_shutdown<S>(shutdown: S) -> PoolResult<()>
where
    S: FnOnce(Callback<()>),
{
    let (callback, rx) = Callback::channel();
    shutdown(callback);
    crate::callback::recv(rx).await
}
