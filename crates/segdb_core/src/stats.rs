//! Index statistics and metrics.
//!
//! Counters are atomic and can be read while operations are in progress.
//! [`SegmentIndex::metrics_snapshot`](crate::SegmentIndex::metrics_snapshot)
//! combines them with gauges read from the map and registry.

use crate::lifecycle::IndexState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters of one index instance.
#[derive(Debug, Default)]
pub struct IndexStats {
    // Operation counters
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    busy_retries: AtomicU64,

    // Structural changes
    splits_applied: AtomicU64,
    splits_compacted: AtomicU64,
    splits_failed: AtomicU64,

    // Segment maintenance
    flushes: AtomicU64,
    compactions: AtomicU64,

    // Registry
    segment_loads: AtomicU64,
    segment_evictions: AtomicU64,

    // Consistency
    consistency_checks: AtomicU64,
    consistency_repairs: AtomicU64,
}

impl IndexStats {
    /// Creates a zeroed stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_busy_retry(&self) {
        self.busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_split_applied(&self) {
        self.splits_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_split_compacted(&self) {
        self.splits_compacted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_split_failed(&self) {
        self.splits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_load(&self) {
        self.segment_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_eviction(&self) {
        self.segment_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_consistency_check(&self) {
        self.consistency_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_consistency_repairs(&self, repairs: u64) {
        self.consistency_repairs.fetch_add(repairs, Ordering::Relaxed);
    }

    /// Returns the number of completed gets.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Returns the number of completed puts.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Returns the number of completed deletes.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns how many attempts ended BUSY/CLOSED and were retried.
    ///
    /// A steadily climbing value usually means splits or maintenance are
    /// not keeping up with the write rate.
    pub fn busy_retries(&self) -> u64 {
        self.busy_retries.load(Ordering::Relaxed)
    }

    /// Returns the number of applied SPLIT plans.
    pub fn splits_applied(&self) -> u64 {
        self.splits_applied.load(Ordering::Relaxed)
    }

    /// Returns the number of applied COMPACTED plans.
    pub fn splits_compacted(&self) -> u64 {
        self.splits_compacted.load(Ordering::Relaxed)
    }

    /// Returns the number of aborted split attempts.
    pub fn splits_failed(&self) -> u64 {
        self.splits_failed.load(Ordering::Relaxed)
    }

    /// Returns the number of segment flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of segment compactions.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Returns how many segments were opened by the registry.
    pub fn segment_loads(&self) -> u64 {
        self.segment_loads.load(Ordering::Relaxed)
    }

    /// Returns how many segments left the registry cache.
    pub fn segment_evictions(&self) -> u64 {
        self.segment_evictions.load(Ordering::Relaxed)
    }

    /// Returns the number of consistency passes run.
    pub fn consistency_checks(&self) -> u64 {
        self.consistency_checks.load(Ordering::Relaxed)
    }

    /// Returns the number of repairs made by consistency passes.
    pub fn consistency_repairs(&self) -> u64 {
        self.consistency_repairs.load(Ordering::Relaxed)
    }
}

/// A point-in-time view of index metrics.
///
/// Unlike [`IndexStats`] this is plain data that can be serialized and compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Lifecycle state when the snapshot was taken.
    pub state: IndexState,
    /// Segments routed by the key map.
    pub segment_count: usize,
    /// Segments currently held by the registry cache.
    pub cached_segments: usize,
    /// Key map version.
    pub map_version: u64,
    /// Completed gets.
    pub gets: u64,
    /// Completed puts.
    pub puts: u64,
    /// Completed deletes.
    pub deletes: u64,
    /// Retried attempts.
    pub busy_retries: u64,
    /// Applied SPLIT plans.
    pub splits_applied: u64,
    /// Applied COMPACTED plans.
    pub splits_compacted: u64,
    /// Aborted split attempts.
    pub splits_failed: u64,
    /// Segment flushes.
    pub flushes: u64,
    /// Segment compactions.
    pub compactions: u64,
    /// Segments opened by the registry.
    pub segment_loads: u64,
    /// Segments evicted from the registry.
    pub segment_evictions: u64,
    /// Consistency passes.
    pub consistency_checks: u64,
    /// Consistency repairs.
    pub consistency_repairs: u64,
}

impl MetricsSnapshot {
    pub(crate) fn capture(
        stats: &IndexStats,
        state: IndexState,
        segment_count: usize,
        cached_segments: usize,
        map_version: u64,
    ) -> Self {
        Self {
            state,
            segment_count,
            cached_segments,
            map_version,
            gets: stats.gets(),
            puts: stats.puts(),
            deletes: stats.deletes(),
            busy_retries: stats.busy_retries(),
            splits_applied: stats.splits_applied(),
            splits_compacted: stats.splits_compacted(),
            splits_failed: stats.splits_failed(),
            flushes: stats.flushes(),
            compactions: stats.compactions(),
            segment_loads: stats.segment_loads(),
            segment_evictions: stats.segment_evictions(),
            consistency_checks: stats.consistency_checks(),
            consistency_repairs: stats.consistency_repairs(),
        }
    }
}
