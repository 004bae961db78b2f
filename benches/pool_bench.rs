//! Hot-path benchmarks: checkout/return cycles and buffer replay.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use transport_pool::{
    AsyncPool, Callback, CallbackBuffer, EvictingCircularBuffer, ExclusivePool, Lifecycle,
    NoopRateLimiter, PoolConfiguration, Scheduler, SharedPool,
};

struct Immediate;

impl Lifecycle<u64> for Immediate {
    fn create(&self, callback: Callback<u64>) {
        callback.on_success(7);
    }

    fn validate_get(&self, _item: &u64) -> bool {
        true
    }

    fn validate_put(&self, _item: &u64) -> bool {
        true
    }

    fn destroy(&self, item: u64, _error: bool, callback: Callback<u64>) {
        callback.on_success(item);
    }
}

impl Lifecycle<Arc<u64>> for Immediate {
    fn create(&self, callback: Callback<Arc<u64>>) {
        callback.on_success(Arc::new(7));
    }

    fn validate_get(&self, _item: &Arc<u64>) -> bool {
        true
    }

    fn validate_put(&self, _item: &Arc<u64>) -> bool {
        true
    }

    fn destroy(&self, item: Arc<u64>, _error: bool, callback: Callback<Arc<u64>>) {
        callback.on_success(item);
    }
}

fn bench_exclusive_cycle(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let scheduler = Scheduler::new(runtime.handle().clone());
    let lifecycle: Arc<dyn Lifecycle<u64>> = Arc::new(Immediate);
    let pool = ExclusivePool::new(
        "bench",
        lifecycle,
        PoolConfiguration::default().with_max_size(64),
        Arc::new(NoopRateLimiter),
        scheduler,
    )
    .unwrap();
    pool.start().unwrap();

    let mut group = c.benchmark_group("exclusive_pool");
    for batch in [1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::new("get_put", batch), &batch, |b, &batch| {
            b.iter(|| {
                let taken = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(batch)));
                for _ in 0..batch {
                    let sink = Arc::clone(&taken);
                    pool.get(Callback::new(move |item| {
                        if let Ok(item) = item {
                            sink.lock().push(item);
                        }
                    }));
                }
                for item in taken.lock().drain(..) {
                    pool.put(black_box(item));
                }
            });
        });
    }
    group.finish();
}

fn bench_shared_cycle(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let scheduler = Scheduler::new(runtime.handle().clone());
    let lifecycle: Arc<dyn Lifecycle<Arc<u64>>> = Arc::new(Immediate);
    let pool = SharedPool::new(
        "bench",
        lifecycle,
        PoolConfiguration::default(),
        Arc::new(NoopRateLimiter),
        scheduler,
    )
    .unwrap();
    pool.start().unwrap();

    c.bench_function("shared_pool_get_put", |b| {
        b.iter(|| {
            let slot = Arc::new(parking_lot::Mutex::new(None));
            let sink = Arc::clone(&slot);
            pool.get(Callback::new(move |item| *sink.lock() = item.ok()));
            if let Some(item) = slot.lock().take() {
                pool.put(black_box(item));
            }
        });
    });
}

fn bench_evicting_buffer(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let _guard = runtime.enter();
    let buffer = EvictingCircularBuffer::new(128, Duration::from_secs(3600)).unwrap();
    for _ in 0..128 {
        buffer.put(Arc::new(|_| {}));
    }

    c.bench_function("evicting_buffer_get", |b| {
        b.iter(|| black_box(buffer.get().is_ok()));
    });
}

criterion_group!(
    benches,
    bench_exclusive_cycle,
    bench_shared_cycle,
    bench_evicting_buffer
);
criterion_main!(benches);
