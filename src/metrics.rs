//! Statistics collection and export for pools

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Immutable statistics snapshot of a pool
///
/// Lifetime counters (`total_*`) only ever grow. The `sample_max_*` values
/// and the wait time distribution cover the interval since the previous
/// snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStats {
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_create_errors: u64,
    pub total_destroy_errors: u64,
    pub total_bad_destroyed: u64,
    pub total_timed_out: u64,
    pub total_waiter_timed_out: u64,
    pub total_creation_ignored: u64,

    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub pool_size: usize,
    pub checked_out: usize,
    pub idle_count: usize,
    pub waiter_count: usize,

    pub sample_max_checked_out: usize,
    pub sample_max_pool_size: usize,

    /// Wait time between a `get` and its resolution, in milliseconds
    pub wait_time_avg: f64,
    pub wait_time_50pct: u64,
    pub wait_time_95pct: u64,
    pub wait_time_99pct: u64,
    pub sample_max_wait_time: u64,
}

impl PoolStats {
    /// Export statistics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        for (name, value) in self.counters() {
            stats.insert(name.to_string(), value.to_string());
        }
        for (name, value) in self.gauges() {
            stats.insert(name.to_string(), value.to_string());
        }
        stats.insert("wait_time_avg".to_string(), format!("{:.2}", self.wait_time_avg));
        stats
    }

    fn counters(&self) -> [(&'static str, u64); 8] {
        [
            ("total_created", self.total_created),
            ("total_destroyed", self.total_destroyed),
            ("total_create_errors", self.total_create_errors),
            ("total_destroy_errors", self.total_destroy_errors),
            ("total_bad_destroyed", self.total_bad_destroyed),
            ("total_timed_out", self.total_timed_out),
            ("total_waiter_timed_out", self.total_waiter_timed_out),
            ("total_creation_ignored", self.total_creation_ignored),
        ]
    }

    fn gauges(&self) -> [(&'static str, u64); 12] {
        [
            ("max_pool_size", self.max_pool_size as u64),
            ("min_pool_size", self.min_pool_size as u64),
            ("pool_size", self.pool_size as u64),
            ("checked_out", self.checked_out as u64),
            ("idle_count", self.idle_count as u64),
            ("waiter_count", self.waiter_count as u64),
            ("sample_max_checked_out", self.sample_max_checked_out as u64),
            ("sample_max_pool_size", self.sample_max_pool_size as u64),
            ("wait_time_50pct", self.wait_time_50pct),
            ("wait_time_95pct", self.wait_time_95pct),
            ("wait_time_99pct", self.wait_time_99pct),
            ("sample_max_wait_time", self.sample_max_wait_time),
        ]
    }
}

/// Statistics exporter for Prometheus
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export statistics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use transport_pool::{MetricsExporter, PoolStats};
    /// use std::collections::HashMap;
    ///
    /// let stats = PoolStats { checked_out: 3, ..Default::default() };
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stats, "my_pool", Some(&tags));
    /// assert!(output.contains("transport_pool_checked_out{pool=\"my_pool\",service=\"api\"} 3"));
    /// ```
    pub fn export_prometheus(
        stats: &PoolStats,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        for (name, value) in stats.gauges() {
            let _ = writeln!(output, "# TYPE transport_pool_{name} gauge");
            let _ = writeln!(output, "transport_pool_{name}{{{labels}}} {value}");
        }
        let _ = writeln!(output, "# TYPE transport_pool_wait_time_avg gauge");
        let _ = writeln!(
            output,
            "transport_pool_wait_time_avg{{{labels}}} {:.2}",
            stats.wait_time_avg
        );
        for (name, value) in stats.counters() {
            let _ = writeln!(output, "# TYPE transport_pool_{name} counter");
            let _ = writeln!(output, "transport_pool_{name}{{{labels}}} {value}");
        }

        output
    }

    /// Publishes a snapshot as gauges in a Prometheus registry.
    #[cfg(feature = "prometheus")]
    pub fn register(
        stats: &PoolStats,
        pool_name: &str,
        registry: &prometheus::Registry,
    ) -> prometheus::Result<()> {
        use prometheus::{IntGauge, Opts};

        let all = stats.counters().into_iter().chain(stats.gauges());
        for (name, value) in all {
            let opts = Opts::new(format!("transport_pool_{name}"), name.replace('_', " "))
                .const_label("pool", pool_name);
            let gauge = IntGauge::with_opts(opts)?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }
        Ok(())
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

const MAX_TRACKED_SAMPLES: usize = 4096;

/// Distribution of durations, reset on every snapshot.
///
/// Keeps the most recent samples once more than a few thousand arrive
/// within one interval.
#[derive(Debug, Default)]
pub(crate) struct LongTracking {
    samples: Vec<u64>,
    next: usize,
    count: u64,
    sum: u128,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct Distribution {
    pub average: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl LongTracking {
    pub fn add(&mut self, value: u64) {
        self.count += 1;
        self.sum += value as u128;
        if self.samples.len() < MAX_TRACKED_SAMPLES {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
            self.next = (self.next + 1) % MAX_TRACKED_SAMPLES;
        }
    }

    pub fn distribution(&self) -> Distribution {
        if self.count == 0 {
            return Distribution::default();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let percentile = |p: f64| {
            let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1]
        };
        Distribution {
            average: self.sum as f64 / self.count as f64,
            p50: percentile(50.0),
            p95: percentile(95.0),
            p99: percentile(99.0),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time pool gauges, read under the pool's lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolGauges {
    pub max_size: usize,
    pub min_size: usize,
    pub pool_size: usize,
    pub checked_out: usize,
    pub idle_count: usize,
    pub waiter_count: usize,
}

type GaugeSupplier = Box<dyn Fn() -> PoolGauges + Send + Sync>;

/// Accumulates pool statistics.
///
/// Counters are atomics so recording never needs the pool lock; gauges are
/// pulled from the pool only when a snapshot is taken.
pub struct PoolStatsTracker {
    created: AtomicU64,
    destroyed: AtomicU64,
    create_errors: AtomicU64,
    destroy_errors: AtomicU64,
    bad_destroyed: AtomicU64,
    timed_out: AtomicU64,
    waiter_timed_out: AtomicU64,
    creation_ignored: AtomicU64,
    sample_max_checked_out: AtomicUsize,
    sample_max_pool_size: AtomicUsize,
    sample_max_wait_time: AtomicU64,
    wait_times: Mutex<LongTracking>,
    gauges: GaugeSupplier,
}

impl PoolStatsTracker {
    pub fn new<F>(gauges: F) -> Self
    where
        F: Fn() -> PoolGauges + Send + Sync + 'static,
    {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            create_errors: AtomicU64::new(0),
            destroy_errors: AtomicU64::new(0),
            bad_destroyed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            waiter_timed_out: AtomicU64::new(0),
            creation_ignored: AtomicU64::new(0),
            sample_max_checked_out: AtomicUsize::new(0),
            sample_max_pool_size: AtomicUsize::new(0),
            sample_max_wait_time: AtomicU64::new(0),
            wait_times: Mutex::new(LongTracking::default()),
            gauges: Box::new(gauges),
        }
    }

    pub fn increment_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_create_errors(&self) {
        self.create_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_destroy_errors(&self) {
        self.destroy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_bad_destroyed(&self) {
        self.bad_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_waiter_timed_out(&self) {
        self.waiter_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_creation_ignored(&self) {
        self.creation_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_max_checked_out(&self, checked_out: usize) {
        self.sample_max_checked_out
            .fetch_max(checked_out, Ordering::Relaxed);
    }

    pub fn sample_max_pool_size(&self, pool_size: usize) {
        self.sample_max_pool_size.fetch_max(pool_size, Ordering::Relaxed);
    }

    pub fn track_wait_time(&self, wait: Duration) {
        let millis = wait.as_millis() as u64;
        self.wait_times.lock().add(millis);
        self.sample_max_wait_time.fetch_max(millis, Ordering::Relaxed);
    }

    /// Takes a snapshot and starts a new sampling interval.
    ///
    /// Must not be called while holding the lock the gauge supplier takes.
    pub fn get_stats(&self) -> PoolStats {
        let gauges = (self.gauges)();
        let wait = {
            let mut wait_times = self.wait_times.lock();
            let distribution = wait_times.distribution();
            wait_times.reset();
            distribution
        };

        PoolStats {
            total_created: self.created.load(Ordering::Relaxed),
            total_destroyed: self.destroyed.load(Ordering::Relaxed),
            total_create_errors: self.create_errors.load(Ordering::Relaxed),
            total_destroy_errors: self.destroy_errors.load(Ordering::Relaxed),
            total_bad_destroyed: self.bad_destroyed.load(Ordering::Relaxed),
            total_timed_out: self.timed_out.load(Ordering::Relaxed),
            total_waiter_timed_out: self.waiter_timed_out.load(Ordering::Relaxed),
            total_creation_ignored: self.creation_ignored.load(Ordering::Relaxed),
            max_pool_size: gauges.max_size,
            min_pool_size: gauges.min_size,
            pool_size: gauges.pool_size,
            checked_out: gauges.checked_out,
            idle_count: gauges.idle_count,
            waiter_count: gauges.waiter_count,
            sample_max_checked_out: self
                .sample_max_checked_out
                .swap(gauges.checked_out, Ordering::Relaxed)
                .max(gauges.checked_out),
            sample_max_pool_size: self
                .sample_max_pool_size
                .swap(gauges.pool_size, Ordering::Relaxed)
                .max(gauges.pool_size),
            wait_time_avg: wait.average,
            wait_time_50pct: wait.p50,
            wait_time_95pct: wait.p95,
            wait_time_99pct: wait.p99,
            sample_max_wait_time: self.sample_max_wait_time.swap(0, Ordering::Relaxed),
        }
    }
}
