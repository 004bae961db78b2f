use super::buffer::{CallbackBuffer, DispatchCallback};
use crate::errors::{PoolError, PoolResult};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Slot {
    item: Option<DispatchCallback>,
    stored_at: Option<Instant>,
}

struct Ring {
    slots: Vec<RwLock<Slot>>,
    ttl: Duration,
}

impl Ring {
    fn with_capacity(capacity: usize, ttl: Duration) -> Self {
        Self {
            slots: (0..capacity).map(|_| RwLock::new(Slot::default())).collect(),
            ttl,
        }
    }

    fn expired(&self, stored_at: Option<Instant>, now: Instant) -> bool {
        stored_at.is_none_or(|at| now.saturating_duration_since(at) > self.ttl)
    }
}

/// Fixed-capacity ring of callbacks sharing one time-to-live.
///
/// Writers never block each other out: `put` overwrites the slot under the
/// writer cursor. `get` does not consume, so a live callback is returned
/// again every time the reader cursor wraps around to it, until it expires.
///
/// # Examples
///
/// ```
/// use transport_pool::{CallbackBuffer, EvictingCircularBuffer};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let buffer = EvictingCircularBuffer::new(4, Duration::from_secs(10)).unwrap();
/// buffer.put(Arc::new(|_| {}));
/// assert!(buffer.get().is_ok());
/// assert!(buffer.get().is_ok());
/// # }
/// ```
pub struct EvictingCircularBuffer {
    ring: RwLock<Ring>,
    reader: AtomicUsize,
    writer: AtomicUsize,
}

impl EvictingCircularBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> PoolResult<Self> {
        if capacity == 0 {
            return Err(PoolError::InvalidConfiguration(
                "buffer capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            ring: RwLock::new(Ring::with_capacity(capacity, ttl)),
            reader: AtomicUsize::new(0),
            writer: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().slots.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ring.read().ttl
    }

    /// Resizes the ring, dropping every stored callback.
    ///
    /// Blocks all readers and writers while the slots are rebuilt; meant for
    /// reconfiguration, not the hot path.
    pub fn set_capacity(&self, capacity: usize) -> PoolResult<()> {
        if capacity == 0 {
            return Err(PoolError::InvalidConfiguration(
                "buffer capacity must be positive".to_string(),
            ));
        }
        let mut ring = self.ring.write();
        let ttl = ring.ttl;
        *ring = Ring::with_capacity(capacity, ttl);
        self.reader.store(0, Ordering::Relaxed);
        self.writer.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.ring.write().ttl = ttl;
    }

    /// Drops every stored callback without invoking it.
    pub fn clear(&self) {
        let ring = self.ring.read();
        for slot in &ring.slots {
            *slot.write() = Slot::default();
        }
    }

    fn next(&self, consume: bool) -> PoolResult<DispatchCallback> {
        let ring = self.ring.read();
        let capacity = ring.slots.len();
        let now = Instant::now();

        for _ in 0..=capacity {
            let index = self.reader.fetch_add(1, Ordering::Relaxed) % capacity;
            let slot = ring.slots[index].upgradable_read();
            if slot.item.is_none() {
                continue;
            }
            if ring.expired(slot.stored_at, now) {
                *RwLockUpgradableReadGuard::upgrade(slot) = Slot::default();
                continue;
            }
            if consume {
                let mut slot = RwLockUpgradableReadGuard::upgrade(slot);
                slot.stored_at = None;
                if let Some(item) = slot.item.take() {
                    return Ok(item);
                }
            } else if let Some(item) = slot.item.clone() {
                return Ok(item);
            }
        }
        Err(PoolError::BufferEmpty)
    }
}

impl CallbackBuffer for EvictingCircularBuffer {
    fn put(&self, callback: DispatchCallback) {
        let ring = self.ring.read();
        let index = self.writer.fetch_add(1, Ordering::Relaxed) % ring.slots.len();
        let mut slot = ring.slots[index].write();
        slot.item = Some(callback);
        slot.stored_at = Some(Instant::now());
    }

    fn get(&self) -> PoolResult<DispatchCallback> {
        self.next(false)
    }

    fn take(&self) -> PoolResult<DispatchCallback> {
        self.next(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::time;

    fn tagged(tag: usize, sink: &Arc<AtomicUsize>) -> DispatchCallback {
        let sink = Arc::clone(sink);
        Arc::new(move |_| sink.store(tag, Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_item_replayed_until_expired() {
        let buffer = EvictingCircularBuffer::new(4, Duration::from_millis(100)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        buffer.put(tagged(7, &seen));

        let mut hits = 0;
        for _ in 0..5 {
            if let Ok(cb) = buffer.get() {
                cb(Ok(()));
                hits += 1;
            }
        }
        assert_eq!(hits, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        time::advance(Duration::from_millis(101)).await;
        assert!(matches!(buffer.get(), Err(PoolError::BufferEmpty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_overwrites_oldest() {
        let buffer = EvictingCircularBuffer::new(2, Duration::from_secs(60)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        buffer.put(tagged(1, &seen));
        buffer.put(tagged(2, &seen));
        buffer.put(tagged(3, &seen));

        let mut tags = Vec::new();
        for _ in 0..2 {
            buffer.get().unwrap()(Ok(()));
            tags.push(seen.load(Ordering::SeqCst));
        }
        tags.sort();
        assert_eq!(tags, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_capacity_clears() {
        let buffer = EvictingCircularBuffer::new(2, Duration::from_secs(60)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        buffer.put(tagged(1, &seen));
        buffer.set_capacity(8).unwrap();

        assert_eq!(buffer.capacity(), 8);
        assert!(matches!(buffer.get(), Err(PoolError::BufferEmpty)));
        assert!(buffer.set_capacity(0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_consumes_live_entries() {
        let buffer = EvictingCircularBuffer::new(4, Duration::from_secs(60)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        buffer.put(tagged(1, &seen));
        buffer.put(tagged(2, &seen));

        let mut tags = Vec::new();
        while let Ok(cb) = buffer.take() {
            cb(Ok(()));
            tags.push(seen.load(Ordering::SeqCst));
        }
        tags.sort();
        assert_eq!(tags, vec![1, 2]);
        assert!(matches!(buffer.get(), Err(PoolError::BufferEmpty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_keeps_capacity() {
        let buffer = EvictingCircularBuffer::new(3, Duration::from_secs(60)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        buffer.put(tagged(1, &seen));
        buffer.clear();

        assert_eq!(buffer.capacity(), 3);
        assert!(matches!(buffer.get(), Err(PoolError::BufferEmpty)));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
