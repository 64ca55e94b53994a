//! Synchronous split coordination: decide, run the pipeline, apply the plan.

use super::pipeline::{self, SplitAbort};
use super::plan::{SplitApplyPlan, SplitStatus};
use crate::keymap::KeySegmentMap;
use crate::registry::SegmentRegistry;
use crate::segment::{Segment, SegmentRef, SegmentState};
use crate::stats::IndexStats;
use crate::types::{Status, StatusResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Returns true if `segment` holds at least `threshold` live keys.
pub fn should_split(segment: &dyn Segment, threshold: usize) -> bool {
    segment.number_of_keys_in_cache() >= threshold
}

/// Splits segments and swaps the result into the map and registry.
#[derive(Debug)]
pub struct SplitCoordinator {
    map: Arc<KeySegmentMap>,
    registry: Arc<SegmentRegistry>,
    stats: Arc<IndexStats>,
    min_keys_to_split: usize,
    backoff: Duration,
    timeout: Duration,
}

impl SplitCoordinator {
    /// Creates a coordinator.
    pub fn new(
        map: Arc<KeySegmentMap>,
        registry: Arc<SegmentRegistry>,
        stats: Arc<IndexStats>,
        min_keys_to_split: usize,
        backoff: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            map,
            registry,
            stats,
            min_keys_to_split,
            backoff,
            timeout,
        }
    }

    /// Splits `segment` if it reached `threshold`.
    ///
    /// Returns the applied outcome, or `None` if nothing changed. Pipeline
    /// failures only abandon the attempt; a failure while applying a
    /// decided plan puts the registry into ERROR.
    pub fn optionally_split(&self, segment: &SegmentRef, threshold: usize) -> Option<SplitStatus> {
        if !should_split(segment.as_ref(), threshold) {
            return None;
        }
        let id = segment.id();
        if !self.registry.is_segment_instance(id, segment) {
            // replaced or evicted since the trigger
            return None;
        }
        if !self.freeze_segment(segment) {
            return None;
        }

        let plan = match pipeline::run(&self.registry, segment, self.min_keys_to_split) {
            Ok(plan) => plan,
            Err(abort) => {
                segment.unfreeze();
                if !matches!(abort, SplitAbort::Infeasible(_)) {
                    self.stats.record_split_failed();
                }
                return None;
            }
        };

        match self.apply_split_plan(&plan, segment) {
            Ok(()) => Some(plan.status),
            Err(_) => None,
        }
    }

    /// Applies a finished plan under the registry freeze.
    ///
    /// BUSY means another structural change held the gate for the whole
    /// busy timeout; the new segments are then discarded. ERROR means the
    /// map rejected the plan and the registry is now failed.
    pub fn apply_split_plan(&self, plan: &SplitApplyPlan, segment: &SegmentRef) -> StatusResult<()> {
        let guard = match self.enter_freeze() {
            Ok(guard) => guard,
            Err(status) => {
                warn!(segment_id = %plan.old_segment_id, %status, "could not freeze registry for split");
                self.discard(plan, segment);
                return Err(status);
            }
        };

        if !self.map.apply_split_plan(plan, &guard) {
            error!(
                segment_id = %plan.old_segment_id,
                lower = %plan.lower_segment_id,
                "key map rejected split plan"
            );
            guard.fail();
            return Err(Status::Error);
        }

        if !self.registry.evict_segment_from_cache(plan.old_segment_id, segment) {
            segment.invalidate_iterators();
            if let Err(status) = segment.close() {
                warn!(segment_id = %plan.old_segment_id, %status, "closing replaced segment failed");
            }
        }
        guard.finish();

        match plan.status {
            SplitStatus::Split => self.stats.record_split_applied(),
            SplitStatus::Compacted => self.stats.record_split_compacted(),
        }
        info!(
            segment_id = %plan.old_segment_id,
            lower = %plan.lower_segment_id,
            upper = ?plan.upper_segment_id.map(|id| id.as_u64()),
            status = %plan.status,
            "split applied"
        );

        if let Err(err) = self.map.flush() {
            // the old files stay until a later flush makes them unreachable
            error!(segment_id = %plan.old_segment_id, error = %err, "key map flush after split failed");
            return Ok(());
        }
        if let Err(status) = self.registry.delete_segment(plan.old_segment_id) {
            warn!(segment_id = %plan.old_segment_id, %status, "could not delete split segment files");
        }
        Ok(())
    }

    /// Moves the segment to FREEZE, waiting out running maintenance.
    fn freeze_segment(&self, segment: &SegmentRef) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if segment.try_freeze() {
                return true;
            }
            match segment.state() {
                SegmentState::MaintenanceRunning if Instant::now() < deadline => {
                    std::thread::sleep(self.backoff);
                }
                _ => return false,
            }
        }
    }

    fn enter_freeze(&self) -> Result<crate::registry::FreezeGuard<'_>, Status> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.registry.try_enter_freeze() {
                Ok(guard) => return Ok(guard),
                Err(Status::Busy) if Instant::now() < deadline => std::thread::sleep(self.backoff),
                Err(status) => return Err(status),
            }
        }
    }

    fn discard(&self, plan: &SplitApplyPlan, segment: &SegmentRef) {
        for id in plan.new_segment_ids() {
            if let Err(status) = self.registry.delete_segment(id) {
                warn!(segment_id = %id, %status, "could not delete discarded split segment");
            }
        }
        segment.unfreeze();
        self.stats.record_split_failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::registry::GateState;
    use crate::segment::hooks::HookedFactory;
    use crate::segment::LsmSegmentFactory;
    use crate::types::{key_from_u64, SegmentId};
    use segdb_storage::{Directory, MemDirectory};

    struct Fixture {
        dir: MemDirectory,
        map: Arc<KeySegmentMap>,
        registry: Arc<SegmentRegistry>,
        coordinator: SplitCoordinator,
    }

    fn fixture() -> Fixture {
        let dir = MemDirectory::new();
        let registry = SegmentRegistry::for_tests(&dir);
        fixture_over(dir, registry)
    }

    fn fixture_over(dir: MemDirectory, registry: SegmentRegistry) -> Fixture {
        let map = Arc::new(KeySegmentMap::open(Arc::new(dir.clone()), 8).unwrap());
        let registry = Arc::new(registry);
        let coordinator = SplitCoordinator::new(
            Arc::clone(&map),
            Arc::clone(&registry),
            Arc::new(IndexStats::new()),
            2,
            Duration::from_millis(1),
            Duration::from_secs(2),
        );
        Fixture {
            dir,
            map,
            registry,
            coordinator,
        }
    }

    fn routed_segment(f: &Fixture, keys: std::ops::RangeInclusive<u64>) -> SegmentRef {
        let segment = f.registry.create_segment().unwrap();
        for k in keys.clone() {
            segment.put(&key_from_u64(k), b"v").unwrap();
        }
        f.map
            .insert_segment(key_from_u64(*keys.end()), segment.id())
            .unwrap();
        segment
    }

    #[test]
    fn below_threshold_is_a_no_op() {
        let f = fixture();
        let segment = routed_segment(&f, 1..=3);
        assert_eq!(f.coordinator.optionally_split(&segment, 4), None);
        assert_eq!(segment.state(), SegmentState::Ready);
        assert_eq!(f.map.snapshot().len(), 1);
    }

    #[test]
    fn split_replaces_segment_everywhere() {
        let f = fixture();
        let segment = routed_segment(&f, 1..=4);
        let old = segment.id();

        assert_eq!(f.coordinator.optionally_split(&segment, 4), Some(SplitStatus::Split));

        let snapshot = f.map.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.contains(old));
        assert_eq!(segment.state(), SegmentState::Closed);
        assert!(!f.registry.segment_exists(old));
        assert_eq!(f.registry.gate_state(), GateState::Ready);
        assert!(f.dir.file_exists("index.map"));

        for k in 1..=4 {
            let id = snapshot.find_segment_id(&key_from_u64(k)).unwrap();
            let owner = f.registry.get_segment(id).unwrap();
            assert_eq!(owner.get(&key_from_u64(k)).unwrap(), Some(b"v".to_vec()));
        }
    }

    /// Plan that hands the range of `old` to the fresh segment `lower`.
    fn takeover_plan(old: SegmentId, lower: SegmentId) -> SplitApplyPlan {
        SplitApplyPlan {
            old_segment_id: old,
            lower_segment_id: lower,
            upper_segment_id: None,
            min_key: key_from_u64(1),
            max_key: key_from_u64(4),
            status: SplitStatus::Compacted,
        }
    }

    #[test]
    fn uncached_replaced_instance_is_closed() {
        let f = fixture();
        let cached = routed_segment(&f, 1..=4);
        let lower = f.registry.create_segment().unwrap();
        let stale = f.registry.factory().open(cached.id()).unwrap().unwrap();

        let plan = takeover_plan(cached.id(), lower.id());
        assert_eq!(f.coordinator.apply_split_plan(&plan, &stale), Ok(()));
        assert_eq!(stale.state(), SegmentState::Closed);
        assert_eq!(cached.state(), SegmentState::Closed);
        assert_eq!(f.map.snapshot().segment_ids(), vec![lower.id()]);
    }

    #[test]
    fn failed_close_of_replaced_instance_does_not_undo_split() {
        let dir = MemDirectory::new();
        let factory = HookedFactory::new(LsmSegmentFactory::new(Arc::new(dir.clone())));
        let hooks = factory.hooks();
        let f = fixture_over(
            dir,
            SegmentRegistry::with_factory(Arc::new(factory), &IndexConfig::default()),
        );
        let cached = routed_segment(&f, 1..=4);
        let lower = f.registry.create_segment().unwrap();
        let stale = f.registry.factory().open(cached.id()).unwrap().unwrap();
        hooks.fail_next_close();

        let plan = takeover_plan(cached.id(), lower.id());
        assert_eq!(f.coordinator.apply_split_plan(&plan, &stale), Ok(()));
        assert_eq!(stale.state(), SegmentState::Ready);
        assert_eq!(f.registry.gate_state(), GateState::Ready);
        assert_eq!(f.map.snapshot().segment_ids(), vec![lower.id()]);
        assert!(!f.registry.segment_exists(cached.id()));
    }

    #[test]
    fn rejected_plan_fails_the_registry() {
        let f = fixture();
        let segment = routed_segment(&f, 1..=4);
        let plan = SplitApplyPlan {
            old_segment_id: SegmentId::new(99),
            lower_segment_id: SegmentId::new(100),
            upper_segment_id: None,
            min_key: key_from_u64(1),
            max_key: key_from_u64(2),
            status: SplitStatus::Compacted,
        };

        assert_eq!(f.coordinator.apply_split_plan(&plan, &segment), Err(Status::Error));
        assert_eq!(f.registry.gate_state(), GateState::Error);
    }

    #[test]
    fn frozen_registry_discards_plan_after_timeout() {
        let f = fixture();
        let coordinator = SplitCoordinator::new(
            Arc::clone(&f.map),
            Arc::clone(&f.registry),
            Arc::new(IndexStats::new()),
            2,
            Duration::from_millis(1),
            Duration::from_millis(20),
        );
        let segment = routed_segment(&f, 1..=4);
        let _held = f.registry.try_enter_freeze().unwrap();

        assert_eq!(coordinator.optionally_split(&segment, 4), None);
        assert_eq!(segment.state(), SegmentState::Ready);
        assert_eq!(f.map.snapshot().segment_ids(), vec![segment.id()]);
        assert_eq!(f.registry.factory().list_segment_ids().unwrap(), vec![segment.id()]);
    }
}
