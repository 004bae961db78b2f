//! Lifecycle collaborator: creates, validates and destroys pooled items

use crate::callback::Callback;
use crate::errors::PoolResult;
use crate::scheduler::Scheduler;

use async_trait::async_trait;
use std::sync::Arc;

/// Supplied by the transport layer; the pool never looks inside an item.
///
/// None of these methods is called while a pool holds its lock.
pub trait Lifecycle<T>: Send + Sync {
    /// Creates a new item and completes `callback` with it.
    fn create(&self, callback: Callback<T>);

    /// Whether an idle item may be handed to a borrower.
    fn validate_get(&self, item: &T) -> bool;

    /// Whether a returned item may go back into the pool.
    fn validate_put(&self, item: &T) -> bool;

    /// Destroys `item`; `error` is set when the item is known to be bad.
    /// `callback` hands the item back once destruction finished.
    fn destroy(&self, item: T, error: bool, callback: Callback<T>);
}

/// Async flavour of [`Lifecycle`] for transports written with `async fn`.
#[async_trait]
pub trait AsyncLifecycle<T>: Send + Sync + 'static {
    async fn create(&self) -> PoolResult<T>;

    fn validate_get(&self, item: &T) -> bool;

    fn validate_put(&self, item: &T) -> bool;

    async fn destroy(&self, item: T, error: bool) -> PoolResult<T>;
}

/// Drives an [`AsyncLifecycle`] on the scheduler's runtime.
pub struct AsyncLifecycleAdapter<L> {
    inner: Arc<L>,
    scheduler: Scheduler,
}

impl<L> AsyncLifecycleAdapter<L> {
    pub fn new(inner: L, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(inner),
            scheduler,
        }
    }
}

impl<T, L> Lifecycle<T> for AsyncLifecycleAdapter<L>
where
    T: Send + 'static,
    L: AsyncLifecycle<T>,
{
    fn create(&self, callback: Callback<T>) {
        let inner = Arc::clone(&self.inner);
        self.scheduler.handle().spawn(async move {
            callback.complete(inner.create().await);
        });
    }

    fn validate_get(&self, item: &T) -> bool {
        self.inner.validate_get(item)
    }

    fn validate_put(&self, item: &T) -> bool {
        self.inner.validate_put(item)
    }

    fn destroy(&self, item: T, error: bool, callback: Callback<T>) {
        let inner = Arc::clone(&self.inner);
        self.scheduler.handle().spawn(async move {
            callback.complete(inner.destroy(item, error).await);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::recv;
    use crate::errors::PoolError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        next: AtomicUsize,
    }

    #[async_trait]
    impl AsyncLifecycle<usize> for Counter {
        async fn create(&self) -> PoolResult<usize> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            if id == 0 {
                return Err(PoolError::CreationFailed("connection refused".into()));
            }
            Ok(id)
        }

        fn validate_get(&self, item: &usize) -> bool {
            *item % 2 == 1
        }

        fn validate_put(&self, _item: &usize) -> bool {
            true
        }

        async fn destroy(&self, item: usize, _error: bool) -> PoolResult<usize> {
            Ok(item)
        }
    }

    #[tokio::test]
    async fn test_adapter_drives_async_lifecycle() {
        let adapter = AsyncLifecycleAdapter::new(
            Counter {
                next: AtomicUsize::new(0),
            },
            Scheduler::current().unwrap(),
        );

        let (callback, rx) = Callback::channel();
        adapter.create(callback);
        assert!(matches!(recv(rx).await, Err(PoolError::CreationFailed(_))));

        let (callback, rx) = Callback::channel();
        adapter.create(callback);
        let item = recv(rx).await.unwrap();
        assert_eq!(item, 1);
        assert!(Lifecycle::validate_get(&adapter, &item));

        let (callback, rx) = Callback::channel();
        adapter.destroy(item, false, callback);
        assert_eq!(recv(rx).await, Ok(1));
    }
}
