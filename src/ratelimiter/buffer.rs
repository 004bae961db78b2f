use crate::errors::{PoolError, PoolResult};

use crossbeam::queue::SegQueue;
use std::sync::Arc;

/// Continuation dispatched by an [`AsyncRateLimiter`](super::AsyncRateLimiter).
///
/// It is shared rather than boxed once because a replaying buffer may
/// dispatch the same continuation many times.
pub type DispatchCallback = Arc<dyn Fn(PoolResult<()>) + Send + Sync>;

/// Storage for callbacks waiting on a permit. Must be thread safe and
/// must not block.
pub trait CallbackBuffer: Send + Sync {
    fn put(&self, callback: DispatchCallback);

    /// Returns the next callback, or [`PoolError::BufferEmpty`].
    fn get(&self) -> PoolResult<DispatchCallback>;

    /// Like [`get`](Self::get), but the returned callback is never handed
    /// out again.
    fn take(&self) -> PoolResult<DispatchCallback> {
        self.get()
    }
}

/// Plain FIFO buffer: every callback is dispatched exactly once.
#[derive(Default)]
pub struct SimpleCallbackBuffer {
    queue: SegQueue<DispatchCallback>,
}

impl SimpleCallbackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl CallbackBuffer for SimpleCallbackBuffer {
    fn put(&self, callback: DispatchCallback) {
        self.queue.push(callback);
    }

    fn get(&self) -> PoolResult<DispatchCallback> {
        self.queue.pop().ok_or(PoolError::BufferEmpty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_buffer_consumes() {
        let buffer = SimpleCallbackBuffer::new();
        buffer.put(Arc::new(|_| {}));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.get().is_ok());
        assert!(matches!(buffer.get(), Err(PoolError::BufferEmpty)));
    }
}
