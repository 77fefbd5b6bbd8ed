//! Replication metrics.
//!
//! A single `const`-initialized [`Metrics`] instance tracks the
//! counters, histograms, and gauges the operator surface scrapes. All
//! fields are atomics: recording costs one relaxed RMW and never
//! contends with the event loop.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance for the replication engine.
pub static METRICS: Metrics = Metrics::new();

/// Number of histogram buckets; bounds are successive powers of ten in
/// microseconds, with the final bucket unbounded.
pub const HISTOGRAM_BUCKETS: usize = 8;

/// Upper bounds (inclusive) of the first seven histogram buckets, in
/// microseconds.
pub const BUCKET_BOUNDS_US: [u64; HISTOGRAM_BUCKETS - 1] =
    [1, 10, 100, 1_000, 10_000, 100_000, 1_000_000];

/// A fixed-bucket latency histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; HISTOGRAM_BUCKETS],
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records one observation in microseconds.
    pub fn record(&self, value_us: u64) {
        let bucket = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| value_us <= bound)
            .unwrap_or(HISTOGRAM_BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Snapshot of bucket counts, cheapest-first.
    pub fn buckets(&self) -> [u64; HISTOGRAM_BUCKETS] {
        let mut out = [0u64; HISTOGRAM_BUCKETS];
        for (slot, bucket) in out.iter_mut().zip(&self.buckets) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        out
    }
}

/// Counters, histograms, and gauges for one replica process.
#[derive(Debug)]
pub struct Metrics {
    // === Counters ===
    commits_total: AtomicU64,
    view_changes_total: AtomicU64,
    envelopes_rejected_total: AtomicU64,

    // === Histograms ===
    /// Submit accepted → quorum reached.
    pub prepare_latency_us: Histogram,
    /// Duration of each WAL fsync.
    pub fsync_latency_us: Histogram,
    /// View-change start → normal status.
    pub view_change_duration_us: Histogram,

    // === Gauges ===
    view: AtomicU64,
    commit_number: AtomicU64,
    queue_depth: AtomicU64,
    open_connections: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commits_total: AtomicU64::new(0),
            view_changes_total: AtomicU64::new(0),
            envelopes_rejected_total: AtomicU64::new(0),
            prepare_latency_us: Histogram::new(),
            fsync_latency_us: Histogram::new(),
            view_change_duration_us: Histogram::new(),
            view: AtomicU64::new(0),
            commit_number: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            open_connections: AtomicU64::new(0),
        }
    }

    pub fn increment_commits(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes(&self) {
        self.view_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected_envelopes(&self) {
        self.envelopes_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_view(&self, view: u64) {
        self.view.store(view, Ordering::Relaxed);
    }

    pub fn set_commit_number(&self, commit: u64) {
        self.commit_number.store(commit, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_open_connections(&self, count: u64) {
        self.open_connections.store(count, Ordering::Relaxed);
    }

    pub fn commits_total(&self) -> u64 {
        self.commits_total.load(Ordering::Relaxed)
    }

    pub fn view_changes_total(&self) -> u64 {
        self.view_changes_total.load(Ordering::Relaxed)
    }

    pub fn envelopes_rejected_total(&self) -> u64 {
        self.envelopes_rejected_total.load(Ordering::Relaxed)
    }

    pub fn view(&self) -> u64 {
        self.view.load(Ordering::Relaxed)
    }

    pub fn commit_number(&self) -> u64 {
        self.commit_number.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_magnitude() {
        let h = Histogram::new();
        h.record(0);
        h.record(1);
        h.record(50);
        h.record(5_000_000);

        let buckets = h.buckets();
        assert_eq!(buckets[0], 2); // 0 and 1
        assert_eq!(buckets[2], 1); // 50
        assert_eq!(buckets[HISTOGRAM_BUCKETS - 1], 1); // overflow bucket
        assert_eq!(h.count(), 4);
        assert_eq!(h.sum_us(), 5_000_051);
    }

    #[test]
    fn counters_and_gauges() {
        let m = Metrics::new();
        m.increment_commits();
        m.increment_commits();
        m.set_view(3);
        m.set_queue_depth(17);

        assert_eq!(m.commits_total(), 2);
        assert_eq!(m.view(), 3);
        assert_eq!(m.queue_depth(), 17);
    }
}
