//! Single-shot continuations and cancellation handles

use crate::errors::{PoolError, PoolResult};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A one-shot result continuation.
///
/// Completing a callback consumes it, so it can be invoked at most once.
///
/// # Examples
///
/// ```
/// use transport_pool::Callback;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(None));
/// let sink = Arc::clone(&seen);
/// let callback = Callback::new(move |result| *sink.lock().unwrap() = Some(result));
///
/// callback.on_success(7);
/// assert_eq!(*seen.lock().unwrap(), Some(Ok(7)));
/// ```
pub struct Callback<T> {
    f: Box<dyn FnOnce(PoolResult<T>) + Send>,
}

impl<T: 'static> Callback<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(PoolResult<T>) + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// A callback that ignores its result.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// A callback that forwards its result into a oneshot channel.
    ///
    /// If the callback is dropped without being completed the receiver
    /// resolves with [`PoolError::Cancelled`] once awaited through
    /// [`recv`].
    pub fn channel() -> (Self, oneshot::Receiver<PoolResult<T>>)
    where
        T: Send,
    {
        let (tx, rx) = oneshot::channel();
        let callback = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    pub fn complete(self, result: PoolResult<T>) {
        (self.f)(result)
    }

    pub fn on_success(self, value: T) {
        self.complete(Ok(value))
    }

    pub fn on_error(self, error: PoolError) {
        self.complete(Err(error))
    }

    /// Wraps this callback so that `hook` observes the result first.
    pub(crate) fn before<H>(self, hook: H) -> Self
    where
        H: FnOnce(&PoolResult<T>) + Send + 'static,
    {
        Self::new(move |result| {
            hook(&result);
            self.complete(result)
        })
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Awaits a receiver produced by [`Callback::channel`].
pub async fn recv<T>(rx: oneshot::Receiver<PoolResult<T>>) -> PoolResult<T> {
    rx.await.unwrap_or(Err(PoolError::Cancelled))
}

/// Handle returned from `get` that removes a still-pending waiter.
pub struct Cancellable {
    cancel: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

impl Cancellable {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(f)),
        }
    }

    /// A handle for a request that was resolved synchronously.
    pub fn resolved() -> Self {
        Self { cancel: None }
    }

    /// Returns `true` if this call removed the pending waiter. Cancelling a
    /// resolved or already-cancelled request returns `false`.
    pub fn cancel(&self) -> bool {
        self.cancel.as_ref().is_some_and(|f| f())
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("pending", &self.cancel.is_some())
            .finish()
    }
}

struct MultiState {
    remaining: usize,
    first_error: Option<PoolError>,
    callback: Option<Callback<()>>,
}

/// Fans `count` completions into a single callback.
///
/// The wrapped callback fires exactly once, after the last completion. The
/// first error reported wins.
#[derive(Clone)]
pub struct MultiCallback {
    state: Arc<Mutex<MultiState>>,
}

impl MultiCallback {
    pub fn new(callback: Callback<()>, count: usize) -> Self {
        let multi = Self {
            state: Arc::new(Mutex::new(MultiState {
                remaining: count,
                first_error: None,
                callback: Some(callback),
            })),
        };
        if count == 0 {
            multi.finish();
        }
        multi
    }

    /// A callback representing one of the `count` completions.
    pub fn part(&self) -> Callback<()> {
        let multi = self.clone();
        Callback::new(move |result| multi.record(result))
    }

    fn record(&self, result: PoolResult<()>) {
        let done = {
            let mut state = self.state.lock();
            if let Err(e) = result {
                state.first_error.get_or_insert(e);
            }
            state.remaining = state.remaining.saturating_sub(1);
            state.remaining == 0
        };
        if done {
            self.finish();
        }
    }

    fn finish(&self) {
        let (callback, error) = {
            let mut state = self.state.lock();
            (state.callback.take(), state.first_error.take())
        };
        if let Some(callback) = callback {
            match error {
                Some(e) => callback.on_error(e),
                None => callback.on_success(()),
            }
        }
    }
}
