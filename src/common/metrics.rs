//! Group commit metrics
//!
//! Lock-free counters, gauges and histograms owned by each group commit
//! instance, rendered in the Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Write latency bucket boundaries (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Batch size bucket boundaries (updates per physical write)
const BATCH_BUCKETS: [f64; 10] = [1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// A simple histogram with fixed bucket boundaries
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Sum kept in thousandths for precision
        self.sum.fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for one group commit instance
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Partial records accepted by `commit`
    pub updates_accepted: Counter,
    /// Drained batches that reached the store
    pub batches_committed: Counter,
    /// Successful conditional writes and creates
    pub writes_succeeded: Counter,
    /// Lost compare-and-swap races
    pub version_conflicts: Counter,
    /// Store failures other than conflicts
    pub store_errors: Counter,
    /// Paths with a running committer
    pub active_committers: Gauge,
    /// Updates merged into each physical write
    pub batch_size: Histogram,
    /// Time from drain to durable write (ms)
    pub write_latency: Histogram,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            updates_accepted: Counter::new(),
            batches_committed: Counter::new(),
            writes_succeeded: Counter::new(),
            version_conflicts: Counter::new(),
            store_errors: Counter::new(),
            active_committers: Gauge::new(),
            batch_size: Histogram::with_buckets(&BATCH_BUCKETS),
            write_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("updates_accepted_total", "Partial records accepted", &self.updates_accepted),
            ("batches_committed_total", "Coalesced batches written", &self.batches_committed),
            ("writes_succeeded_total", "Successful conditional writes", &self.writes_succeeded),
            ("version_conflicts_total", "Version conflicts retried", &self.version_conflicts),
            ("store_errors_total", "Store failures retried with backoff", &self.store_errors),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP clustermgr_group_commit_{} {}", name, help);
            let _ = writeln!(out, "# TYPE clustermgr_group_commit_{} counter", name);
            let _ = writeln!(out, "clustermgr_group_commit_{} {}", name, counter.get());
        }

        out.push_str("# HELP clustermgr_group_commit_active_committers Paths with a running committer\n");
        out.push_str("# TYPE clustermgr_group_commit_active_committers gauge\n");
        let _ = writeln!(
            out,
            "clustermgr_group_commit_active_committers {}",
            self.active_committers.get()
        );

        write_histogram(&mut out, "clustermgr_group_commit_batch_size", "Updates per write", &self.batch_size);
        write_histogram(
            &mut out,
            "clustermgr_group_commit_write_duration_ms",
            "Drain to durable write in milliseconds",
            &self.write_latency,
        );

        out.push_str("# HELP clustermgr_uptime_seconds Uptime in seconds\n");
        out.push_str("# TYPE clustermgr_uptime_seconds gauge\n");
        let _ = writeln!(out, "clustermgr_uptime_seconds {}", self.uptime_seconds());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn write_histogram(out: &mut String, name: &str, help: &str, histogram: &Histogram) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} histogram", name);
    for (le, count) in histogram.get_buckets() {
        if le.is_infinite() {
            let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        } else {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, le, count);
        }
    }
    let _ = writeln!(out, "{}_sum {}", name, histogram.sum());
    let _ = writeln!(out, "{}_count {}", name, histogram.count());
}
