//! Post-write maintenance triggers.
//!
//! After every successful write the core hands the segment to
//! [`MaintenanceCoordinator::after_write`]. A pure [`decide`] compares the
//! segment against the configured limits; flush and compaction run on the
//! maintenance pool, splits go through the [`AsyncSplitCoordinator`].
//! Nothing here blocks the write path.

use crate::config::IndexConfig;
use crate::executor::ExecutorLease;
use crate::registry::SegmentRegistry;
use crate::segment::{Segment, SegmentRef};
use crate::split::{should_split, AsyncSplitCoordinator};
use crate::stats::IndexStats;
use crate::types::{SegmentId, Status, StatusResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn, Span};

/// Limits that trigger maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceThresholds {
    /// Write cache entries that trigger a flush.
    pub write_cache: usize,
    /// Delta files that trigger a compaction.
    pub delta_files: usize,
    /// Live keys that trigger a split.
    pub split: usize,
}

impl From<&IndexConfig> for MaintenanceThresholds {
    fn from(config: &IndexConfig) -> Self {
        Self {
            write_cache: config.max_number_of_keys_in_segment_write_cache,
            delta_files: config.max_number_of_delta_files,
            split: config.max_number_of_keys_in_segment,
        }
    }
}

/// Which maintenance a segment needs. The triggers are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceDecision {
    /// Persist the write cache as a delta file.
    pub flush: bool,
    /// Merge the delta files into the main file.
    pub compact: bool,
    /// Split the segment.
    pub split: bool,
}

impl MaintenanceDecision {
    /// Returns true if nothing needs to run.
    pub fn is_empty(&self) -> bool {
        !(self.flush || self.compact || self.split)
    }
}

/// Decides the maintenance `segment` needs.
pub fn decide(segment: &dyn Segment, thresholds: &MaintenanceThresholds) -> MaintenanceDecision {
    MaintenanceDecision {
        flush: segment.write_cache_size() >= thresholds.write_cache,
        compact: segment.delta_file_count() >= thresholds.delta_files,
        split: should_split(segment, thresholds.split),
    }
}

/// Kind of segment maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceKind {
    /// Segment flush.
    Flush,
    /// Segment compaction.
    Compact,
}

#[derive(Default)]
struct Pending {
    tasks: Mutex<HashSet<(SegmentId, MaintenanceKind)>>,
    idle: Condvar,
}

impl Pending {
    fn finish(&self, key: (SegmentId, MaintenanceKind)) {
        let mut tasks = self.tasks.lock();
        tasks.remove(&key);
        if tasks.is_empty() {
            self.idle.notify_all();
        }
    }
}

/// Schedules flush, compaction and split after writes.
pub struct MaintenanceCoordinator {
    registry: Arc<SegmentRegistry>,
    splits: Arc<AsyncSplitCoordinator>,
    pool: ExecutorLease,
    thresholds: MaintenanceThresholds,
    pending: Arc<Pending>,
    stats: Arc<IndexStats>,
    closed: AtomicBool,
    span: Span,
}

impl MaintenanceCoordinator {
    /// Creates a coordinator scheduling on `pool`.
    pub fn new(
        registry: Arc<SegmentRegistry>,
        splits: Arc<AsyncSplitCoordinator>,
        pool: ExecutorLease,
        thresholds: MaintenanceThresholds,
        stats: Arc<IndexStats>,
        span: Span,
    ) -> Self {
        Self {
            registry,
            splits,
            pool,
            thresholds,
            pending: Arc::new(Pending::default()),
            stats,
            closed: AtomicBool::new(false),
            span,
        }
    }

    /// Returns the split coordinator used for split triggers.
    pub fn splits(&self) -> &Arc<AsyncSplitCoordinator> {
        &self.splits
    }

    /// Runs the decision for a segment that just accepted a write.
    pub fn after_write(&self, segment: &SegmentRef) -> MaintenanceDecision {
        let decision = decide(segment.as_ref(), &self.thresholds);
        if decision.is_empty() || self.closed.load(Ordering::Acquire) {
            return decision;
        }
        debug!(segment_id = %segment.id(), ?decision, "maintenance triggered");
        if decision.flush {
            self.schedule(segment, MaintenanceKind::Flush);
        }
        if decision.compact {
            self.schedule(segment, MaintenanceKind::Compact);
        }
        if decision.split {
            self.splits.trigger(Arc::clone(segment), self.thresholds.split);
        }
        decision
    }

    /// Schedules a flush of segment `id`.
    ///
    /// Returns false if one is already pending.
    pub fn request_flush(&self, id: SegmentId) -> StatusResult<bool> {
        let segment = self.registry.get_segment(id)?;
        Ok(self.schedule(&segment, MaintenanceKind::Flush))
    }

    /// Schedules a compaction of segment `id`.
    ///
    /// Returns false if one is already pending.
    pub fn request_compact(&self, id: SegmentId) -> StatusResult<bool> {
        let segment = self.registry.get_segment(id)?;
        Ok(self.schedule(&segment, MaintenanceKind::Compact))
    }

    /// Returns the number of scheduled flushes and compactions.
    pub fn pending_tasks(&self) -> usize {
        self.pending.tasks.lock().len()
    }

    /// Waits until no flush or compaction is pending. Returns false on timeout.
    pub fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.pending.tasks.lock();
        while !tasks.is_empty() {
            if self.pending.idle.wait_until(&mut tasks, deadline).timed_out() {
                return tasks.is_empty();
            }
        }
        true
    }

    /// Stops scheduling. Pending tasks still run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn schedule(&self, segment: &SegmentRef, kind: MaintenanceKind) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let key = (segment.id(), kind);
        if !self.pending.tasks.lock().insert(key) {
            return false;
        }

        let task = MaintenanceTask {
            registry: Arc::clone(&self.registry),
            pending: Arc::clone(&self.pending),
            stats: Arc::clone(&self.stats),
            segment: Arc::clone(segment),
            kind,
            span: self.span.clone(),
        };
        if let Err(err) = self.pool.submit(move || task.run()) {
            warn!(segment_id = %key.0, ?kind, error = %err, "maintenance not scheduled");
            self.pending.finish(key);
            return false;
        }
        true
    }
}

impl fmt::Debug for MaintenanceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceCoordinator")
            .field("thresholds", &self.thresholds)
            .field("pending", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

struct MaintenanceTask {
    registry: Arc<SegmentRegistry>,
    pending: Arc<Pending>,
    stats: Arc<IndexStats>,
    segment: SegmentRef,
    kind: MaintenanceKind,
    span: Span,
}

impl MaintenanceTask {
    fn run(self) {
        let _entered = self.span.enter();
        let id = self.segment.id();
        let key = (id, self.kind);

        if self.registry.is_segment_instance(id, &self.segment) {
            let result = match self.kind {
                MaintenanceKind::Flush => self.segment.flush(),
                MaintenanceKind::Compact => self.segment.compact(),
            };
            match result {
                Ok(()) => match self.kind {
                    MaintenanceKind::Flush => self.stats.record_flush(),
                    MaintenanceKind::Compact => self.stats.record_compaction(),
                },
                Err(Status::Busy | Status::Closed) => {
                    debug!(segment_id = %id, kind = ?self.kind, "maintenance skipped");
                }
                Err(Status::Error) => {
                    error!(segment_id = %id, kind = ?self.kind, "segment maintenance failed");
                }
            }
        } else {
            // split away or evicted since the trigger
            debug!(segment_id = %id, kind = ?self.kind, "maintenance target replaced");
        }
        self.pending.finish(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;
    use crate::keymap::KeySegmentMap;
    use crate::segment::{LsmSegmentFactory, SegmentFactory};
    use crate::split::SplitCoordinator;
    use crate::types::key_from_u64;
    use segdb_storage::MemDirectory;
    use std::sync::Barrier;

    const THRESHOLDS: MaintenanceThresholds = MaintenanceThresholds {
        write_cache: 3,
        delta_files: 2,
        split: 100,
    };

    struct Fixture {
        map: Arc<KeySegmentMap>,
        registry: Arc<SegmentRegistry>,
        stats: Arc<IndexStats>,
        lease: ExecutorLease,
        maintenance: MaintenanceCoordinator,
        _executors: ExecutorRegistry,
    }

    fn fixture(name: &str, thresholds: MaintenanceThresholds) -> Fixture {
        let dir = MemDirectory::new();
        let map = Arc::new(KeySegmentMap::open(Arc::new(dir.clone()), 8).unwrap());
        let registry = Arc::new(SegmentRegistry::for_tests(&dir));
        let stats = Arc::new(IndexStats::new());
        let executors = ExecutorRegistry::new();
        let lease = executors.lease(name, 1, 16).unwrap();
        let coordinator = Arc::new(SplitCoordinator::new(
            Arc::clone(&map),
            Arc::clone(&registry),
            Arc::clone(&stats),
            2,
            Duration::from_millis(1),
            Duration::from_secs(2),
        ));
        let splits = Arc::new(AsyncSplitCoordinator::new(coordinator, lease.clone(), Span::none()));
        let maintenance = MaintenanceCoordinator::new(
            Arc::clone(&registry),
            splits,
            lease.clone(),
            thresholds,
            Arc::clone(&stats),
            Span::none(),
        );
        Fixture {
            map,
            registry,
            stats,
            lease,
            maintenance,
            _executors: executors,
        }
    }

    fn write(segment: &SegmentRef, keys: std::ops::RangeInclusive<u64>) {
        for k in keys {
            segment.put(&key_from_u64(k), b"v").unwrap();
        }
    }

    #[test]
    fn decision_compares_each_limit() {
        let f = fixture("test-maint-decide", THRESHOLDS);
        let segment = f.registry.create_segment().unwrap();
        assert!(decide(segment.as_ref(), &THRESHOLDS).is_empty());

        write(&segment, 1..=3);
        assert_eq!(
            decide(segment.as_ref(), &THRESHOLDS),
            MaintenanceDecision {
                flush: true,
                compact: false,
                split: false
            }
        );

        segment.flush().unwrap();
        write(&segment, 4..=4);
        segment.flush().unwrap();
        let decision = decide(segment.as_ref(), &MaintenanceThresholds { split: 4, ..THRESHOLDS });
        assert!(!decision.flush);
        assert!(decision.compact);
        assert!(decision.split);
    }

    #[test]
    fn flush_runs_in_background() {
        let f = fixture("test-maint-flush", THRESHOLDS);
        let segment = f.registry.create_segment().unwrap();
        write(&segment, 1..=3);

        assert!(f.maintenance.after_write(&segment).flush);
        assert!(f.maintenance.await_idle(Duration::from_secs(5)));
        assert_eq!(segment.write_cache_size(), 0);
        assert_eq!(segment.delta_file_count(), 1);
        assert_eq!(f.stats.flushes(), 1);
    }

    #[test]
    fn pending_work_is_deduplicated() {
        let f = fixture("test-maint-dedup", THRESHOLDS);
        let segment = f.registry.create_segment().unwrap();
        write(&segment, 1..=3);

        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        f.lease
            .submit(move || {
                s.wait();
                r.wait();
            })
            .unwrap();
        started.wait();

        f.maintenance.after_write(&segment);
        f.maintenance.after_write(&segment);
        assert_eq!(f.maintenance.request_flush(segment.id()), Ok(false));
        assert_eq!(f.maintenance.pending_tasks(), 1);
        assert!(!f.maintenance.await_idle(Duration::from_millis(10)));

        release.wait();
        assert!(f.maintenance.await_idle(Duration::from_secs(5)));
        assert_eq!(f.stats.flushes(), 1);
    }

    #[test]
    fn split_trigger_goes_through_async_coordinator() {
        let thresholds = MaintenanceThresholds {
            write_cache: 1_000,
            delta_files: 1_000,
            split: 4,
        };
        let f = fixture("test-maint-split", thresholds);
        let segment = f.registry.create_segment().unwrap();
        write(&segment, 1..=4);
        f.map.insert_segment(key_from_u64(4), segment.id()).unwrap();

        assert!(f.maintenance.after_write(&segment).split);
        assert!(f
            .maintenance
            .splits()
            .await_all_completions(Duration::from_secs(5)));
        assert_eq!(f.map.snapshot().len(), 2);
        assert_eq!(f.stats.splits_applied(), 1);
    }

    #[test]
    fn replaced_segments_are_not_maintained() {
        let f = fixture("test-maint-replaced", THRESHOLDS);
        let foreign = LsmSegmentFactory::new(Arc::new(MemDirectory::new()))
            .create(SegmentId::new(50))
            .unwrap();
        write(&foreign, 1..=3);

        assert!(f.maintenance.after_write(&foreign).flush);
        assert!(f.maintenance.await_idle(Duration::from_secs(5)));
        assert_eq!(foreign.write_cache_size(), 3);
        assert_eq!(f.stats.flushes(), 0);

        f.maintenance.close();
        assert!(f.maintenance.after_write(&foreign).flush);
        assert_eq!(f.maintenance.pending_tasks(), 0);
    }
}
