//! Keyed registry of pools, one per remote address

use crate::callback::{Callback, MultiCallback};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::PoolStats;
use crate::pool::{AsyncPool, PoolState};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedAsyncPool<T> = Arc<dyn AsyncPool<T>>;

/// Builds the pool for a key the manager has not seen yet.
pub trait PoolFactory<K, T>: Send + Sync {
    fn create(&self, key: &K) -> PoolResult<SharedAsyncPool<T>>;
}

impl<K, T, F> PoolFactory<K, T> for F
where
    F: Fn(&K) -> PoolResult<SharedAsyncPool<T>> + Send + Sync,
{
    fn create(&self, key: &K) -> PoolResult<SharedAsyncPool<T>> {
        self(key)
    }
}

/// Owns one started pool per key, created on first use.
///
/// Lookups of existing pools never take the manager lock; creation is
/// serialized so a key is only ever built once.
pub struct PoolManager<K, T> {
    name: String,
    pools: DashMap<K, SharedAsyncPool<T>>,
    factory: Box<dyn PoolFactory<K, T>>,
    state: Arc<Mutex<PoolState>>,
}

impl<K, T> PoolManager<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: PoolFactory<K, T> + 'static,
    {
        Self {
            name: name.into(),
            pools: DashMap::new(),
            factory: Box::new(factory),
            state: Arc::new(Mutex::new(PoolState::Running)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Returns the pool for `key`, creating and starting it if needed.
    ///
    /// The factory and `start` run without the manager lock. When two
    /// callers race on a new key, the loser's pool is shut down and the
    /// winner's returned.
    pub fn get_pool_for_address(&self, key: &K) -> PoolResult<SharedAsyncPool<T>> {
        if let Some(pool) = self.pools.get(key) {
            return Ok(Arc::clone(pool.value()));
        }
        self.ensure_running()?;

        let built = self.factory.create(key)?;
        built.start()?;

        let (pool, rejected) = {
            let state = self.state.lock();
            if *state != PoolState::Running {
                (Err(PoolError::illegal_state(&self.name, *state)), Some(built))
            } else {
                match self.pools.entry(key.clone()) {
                    Entry::Occupied(existing) => (Ok(Arc::clone(existing.get())), Some(built)),
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::clone(&built));
                        debug!(manager = %self.name, key = ?key, pool = %built.name(), "created pool");
                        (Ok(built), None)
                    }
                }
            }
        };
        if let Some(extra) = rejected {
            debug!(manager = %self.name, key = ?key, "discarding pool built concurrently");
            extra.shutdown(Callback::noop());
        }
        pool
    }

    fn ensure_running(&self) -> PoolResult<()> {
        let state = self.state.lock();
        if *state != PoolState::Running {
            return Err(PoolError::illegal_state(&self.name, *state));
        }
        Ok(())
    }

    /// Shuts down every pool in parallel. `callback` fires after the last
    /// pool stopped, with the first error any of them reported.
    pub fn shutdown(&self, callback: Callback<()>) {
        let pools: Vec<SharedAsyncPool<T>> = {
            let mut state = self.state.lock();
            if *state != PoolState::Running {
                let error = PoolError::illegal_state(&self.name, *state);
                drop(state);
                callback.on_error(error);
                return;
            }
            *state = PoolState::ShuttingDown;
            self.pools.iter().map(|entry| Arc::clone(entry.value())).collect()
        };

        info!(manager = %self.name, pools = pools.len(), "shutting down pools");
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        let all = MultiCallback::new(
            Callback::new(move |result| {
                *state.lock() = PoolState::Stopped;
                info!(manager = %name, "all pools stopped");
                callback.complete(result);
            }),
            pools.len(),
        );
        for pool in pools {
            pool.shutdown(all.part());
        }
    }

    pub async fn shutdown_async(&self) -> PoolResult<()> {
        let (callback, rx) = Callback::channel();
        self.shutdown(callback);
        crate::callback::recv(rx).await
    }

    /// Snapshot of every pool, keyed by pool name.
    pub fn get_pool_stats(&self) -> HashMap<String, PoolStats> {
        let pools: Vec<SharedAsyncPool<T>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        pools
            .into_iter()
            .map(|pool| (pool.name().to_string(), pool.get_stats()))
            .collect()
    }

    /// Removes the waiters of every pool. The caller owns the callbacks.
    pub fn cancel_waiters(&self) -> Vec<Callback<T>> {
        let pools: Vec<SharedAsyncPool<T>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        pools
            .into_iter()
            .flat_map(|pool| pool.cancel_waiters())
            .collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::recv;
    use crate::config::PoolConfiguration;
    use crate::lifecycle::Lifecycle;
    use crate::pool::ExclusivePool;
    use crate::ratelimiter::NoopRateLimiter;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    struct Sockets;

    impl Lifecycle<String> for Sockets {
        fn create(&self, callback: Callback<String>) {
            callback.on_success("socket".to_string());
        }

        fn validate_get(&self, _item: &String) -> bool {
            true
        }

        fn validate_put(&self, _item: &String) -> bool {
            true
        }

        fn destroy(&self, item: String, _error: bool, callback: Callback<String>) {
            callback.on_success(item);
        }
    }

    fn manager(built: Arc<AtomicUsize>) -> PoolManager<String, String> {
        let scheduler = Scheduler::current().unwrap();
        PoolManager::new("hosts", move |address: &String| -> PoolResult<SharedAsyncPool<String>> {
            built.fetch_add(1, Ordering::SeqCst);
            let pool = ExclusivePool::<String>::new(
                address.clone(),
                Arc::new(Sockets),
                PoolConfiguration::default().with_max_size(1),
                Arc::new(NoopRateLimiter),
                scheduler.clone(),
            )?;
            Ok(Arc::new(pool) as SharedAsyncPool<String>)
        })
    }

    #[tokio::test]
    async fn test_pool_created_once_per_address() {
        let built = Arc::new(AtomicUsize::new(0));
        let manager = manager(Arc::clone(&built));

        let a = manager.get_pool_for_address(&"a:80".to_string()).unwrap();
        let again = manager.get_pool_for_address(&"a:80".to_string()).unwrap();
        manager.get_pool_for_address(&"b:80".to_string()).unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(manager.pool_count(), 2);

        let stats = manager.get_pool_stats();
        assert!(stats.contains_key("a:80"));
        assert!(stats.contains_key("b:80"));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_every_pool() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        let pool = manager.get_pool_for_address(&"a:80".to_string()).unwrap();
        manager.get_pool_for_address(&"b:80".to_string()).unwrap();

        let (item_cb, item_rx) = Callback::channel();
        pool.get(item_cb);
        let item = recv(item_rx).await.unwrap();

        let (callback, mut rx) = Callback::channel();
        manager.shutdown(callback);
        assert_eq!(manager.state(), PoolState::ShuttingDown);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            manager.get_pool_for_address(&"c:80".to_string()),
            Err(PoolError::IllegalState(_))
        ));

        pool.put(item);
        assert_eq!(recv(rx).await, Ok(()));
        assert_eq!(manager.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_without_pools_completes() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        manager.shutdown_async().await.unwrap();
        assert!(manager.shutdown_async().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_waiters_across_pools() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        let pool = manager.get_pool_for_address(&"a:80".to_string()).unwrap();

        let (held_cb, held_rx) = Callback::channel();
        pool.get(held_cb);
        let _held = recv(held_rx).await.unwrap();
        let (waiting, _waiting_rx) = Callback::channel();
        pool.get(waiting);

        assert_eq!(manager.cancel_waiters().len(), 1);
        assert_eq!(pool.get_stats().waiter_count, 0);
    }

    /// Pre-warms on creation and reports whether the manager lock was free.
    struct Probing {
        manager: Arc<OnceLock<Weak<PoolManager<String, String>>>>,
        observed: Arc<Mutex<Vec<PoolState>>>,
    }

    impl Lifecycle<String> for Probing {
        fn create(&self, callback: Callback<String>) {
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                self.observed.lock().push(manager.state());
            }
            callback.on_success("socket".to_string());
        }

        fn validate_get(&self, _item: &String) -> bool {
            true
        }

        fn validate_put(&self, _item: &String) -> bool {
            true
        }

        fn destroy(&self, item: String, _error: bool, callback: Callback<String>) {
            callback.on_success(item);
        }
    }

    #[tokio::test]
    async fn test_prewarm_runs_outside_manager_lock() {
        let scheduler = Scheduler::current().unwrap();
        let cell: Arc<OnceLock<Weak<PoolManager<String, String>>>> = Arc::new(OnceLock::new());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (lifecycle_cell, lifecycle_observed) = (Arc::clone(&cell), Arc::clone(&observed));
        let manager = Arc::new(PoolManager::new(
            "hosts",
            move |address: &String| -> PoolResult<SharedAsyncPool<String>> {
                let pool = ExclusivePool::<String>::new(
                    address.clone(),
                    Arc::new(Probing {
                        manager: Arc::clone(&lifecycle_cell),
                        observed: Arc::clone(&lifecycle_observed),
                    }),
                    PoolConfiguration::default().with_min_size(2),
                    Arc::new(NoopRateLimiter),
                    scheduler.clone(),
                )?;
                Ok(Arc::new(pool) as SharedAsyncPool<String>)
            },
        ));
        let _ = cell.set(Arc::downgrade(&manager));

        let pool = manager.get_pool_for_address(&"a:80".to_string()).unwrap();

        assert_eq!(*observed.lock(), vec![PoolState::Running; 2]);
        assert_eq!(pool.get_stats().idle_count, 2);
        assert_eq!(manager.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_no_pool_built_after_shutdown() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        manager.shutdown_async().await.unwrap();

        assert!(matches!(
            manager.get_pool_for_address(&"a:80".to_string()),
            Err(PoolError::IllegalState(_))
        ));
        assert_eq!(manager.pool_count(), 0);
    }
}
