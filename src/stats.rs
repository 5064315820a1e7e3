//! Store Statistics
//!
//! Atomic counters for the things callers actually tune against (commit
//! and abort counts, allocator byte totals) plus a logarithmic-bucket
//! latency histogram for the operations that can suspend a caller
//! (`sync`, `commit`, snapshot `commit`, `restore`).

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Logarithmic-bucket latency histogram.
pub struct Histogram {
    buckets: Mutex<BTreeMap<u64, u64>>,
    count: AtomicU64,
    sum_nanos: AtomicU64,
    min_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            count: AtomicU64::new(0),
            sum_nanos: AtomicU64::new(0),
            min_nanos: AtomicU64::new(u64::MAX),
            max_nanos: AtomicU64::new(0),
        }
    }

    pub fn record(&self, d: Duration) {
        let nanos = d.as_nanos() as u64;
        let bucket = Self::bucket_for(nanos);
        *self.buckets.lock().entry(bucket).or_insert(0) += 1;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.min_nanos.fetch_min(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn bucket_for(nanos: u64) -> u64 {
        if nanos == 0 {
            0
        } else {
            64 - nanos.leading_zeros() as u64
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_nanos(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum_nanos.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn min_nanos(&self) -> u64 {
        let min = self.min_nanos.load(Ordering::Relaxed);
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    pub fn max_nanos(&self) -> u64 {
        self.max_nanos.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-region statistics. Cheaply cloneable via the caller wrapping it
/// in `Arc`.
pub struct StoreStats {
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
    pub conflicts: AtomicU64,
    pub snapshots_committed: AtomicU64,
    pub snapshots_restored: AtomicU64,
    pub checkpoints_validated: AtomicU64,
    pub bytes_allocated: AtomicU64,
    pub bytes_freed: AtomicU64,
    pub sync_latency: Histogram,
    pub commit_latency: Histogram,
    pub snapshot_commit_latency: Histogram,
    pub restore_latency: Histogram,
    start: std::time::Instant,
}

impl StoreStats {
    pub fn new() -> Self {
        Self {
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            snapshots_committed: AtomicU64::new(0),
            snapshots_restored: AtomicU64::new(0),
            checkpoints_validated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            sync_latency: Histogram::new(),
            commit_latency: Histogram::new(),
            snapshot_commit_latency: Histogram::new(),
            restore_latency: Histogram::new(),
            start: std::time::Instant::now(),
        }
    }

    pub fn record_commit(&self, d: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_latency.record(d);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, d: Duration) {
        self.sync_latency.record(d);
    }

    pub fn record_snapshot_commit(&self, d: Duration) {
        self.snapshots_committed.fetch_add(1, Ordering::Relaxed);
        self.snapshot_commit_latency.record(d);
    }

    pub fn record_restore(&self, d: Duration) {
        self.snapshots_restored.fetch_add(1, Ordering::Relaxed);
        self.restore_latency.record(d);
    }

    pub fn record_checkpoint_validated(&self) {
        self.checkpoints_validated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc(&self, bytes: u64) {
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_free(&self, bytes: u64) {
        self.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn summary(&self) -> StoreStatsSummary {
        StoreStatsSummary {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            snapshots_committed: self.snapshots_committed.load(Ordering::Relaxed),
            snapshots_restored: self.snapshots_restored.load(Ordering::Relaxed),
            checkpoints_validated: self.checkpoints_validated.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
        }
    }
}

impl Default for StoreStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of `StoreStats`, suitable for logging or exposing
/// to a caller without holding atomics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStatsSummary {
    pub commits: u64,
    pub aborts: u64,
    pub conflicts: u64,
    pub snapshots_committed: u64,
    pub snapshots_restored: u64,
    pub checkpoints_validated: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
}
