//! Full-scan reconciliation of the key map with the segments it routes to.
//!
//! The map is trusted to name the segments that must exist. Findings that
//! lose no data are repaired (empty segments are dropped, the unbounded last
//! entry is widened); anything else aborts the pass as corruption.

use crate::error::{IndexError, IndexResult};
use crate::keymap::KeySegmentMap;
use crate::registry::SegmentRegistry;
use crate::segment::SegmentRef;
use crate::stats::IndexStats;
use crate::types::{SegmentId, Status, StatusResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What a consistency pass found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Map entries examined.
    pub checked: usize,
    /// Empty segments removed from the map and the registry.
    pub removed: Vec<SegmentId>,
    /// Whether the last entry was widened to its segment's true max key.
    pub extended: bool,
}

impl ConsistencyReport {
    /// Number of repairs applied.
    pub fn repairs(&self) -> usize {
        self.removed.len() + usize::from(self.extended)
    }
}

/// Runs consistency passes over one index.
#[derive(Debug)]
pub struct ConsistencyChecker {
    map: Arc<KeySegmentMap>,
    registry: Arc<SegmentRegistry>,
    stats: Arc<IndexStats>,
    backoff: Duration,
    timeout: Duration,
}

impl ConsistencyChecker {
    /// Creates a checker.
    pub fn new(
        map: Arc<KeySegmentMap>,
        registry: Arc<SegmentRegistry>,
        stats: Arc<IndexStats>,
        backoff: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            map,
            registry,
            stats,
            backoff,
            timeout,
        }
    }

    /// Checks every map entry and applies the safe repairs.
    ///
    /// # Errors
    ///
    /// `Corruption` if an entry is null, routes to a missing or unreadable
    /// segment, or under-counts the range of a segment other than the last.
    pub fn check_and_repair(&self) -> IndexResult<ConsistencyReport> {
        let snapshot = self.map.snapshot();
        let last = snapshot.len().saturating_sub(1);
        let mut report = ConsistencyReport::default();

        for (pos, (max_key, id)) in snapshot.entries().iter().enumerate() {
            report.checked += 1;
            if max_key.is_empty() {
                return Err(IndexError::corruption(format!(
                    "map entry {pos} has an empty max key"
                )));
            }
            if id.is_null() {
                return Err(IndexError::corruption(format!(
                    "map entry {pos} routes to a null segment id"
                )));
            }

            let Some(segment) = self.load(*id)? else {
                continue;
            };
            let live_max = self
                .retry(|| segment.check_and_repair_consistency())
                .map_err(|status| match status {
                    Status::Error => {
                        IndexError::corruption(format!("{id} failed its consistency check"))
                    }
                    other => IndexError::from_status("check_consistency", Some(*id), other, true),
                })?;

            match live_max {
                None => {
                    if self.remove_empty(*id, &segment)? {
                        report.removed.push(*id);
                    }
                }
                Some(live_max) if live_max > *max_key => {
                    if pos != last {
                        return Err(IndexError::corruption(format!(
                            "{id} holds keys beyond its persisted max key"
                        )));
                    }
                    warn!(segment_id = %id, "widening last map entry");
                    self.extend_last(&live_max)?;
                    report.extended = true;
                }
                Some(_) => {}
            }
        }

        if report.repairs() > 0 {
            self.map.flush()?;
        }
        self.stats.record_consistency_check();
        self.stats.record_consistency_repairs(report.repairs() as u64);
        info!(
            checked = report.checked,
            removed = report.removed.len(),
            extended = report.extended,
            "consistency check finished"
        );
        Ok(report)
    }

    /// Loads segment `id`. `None` if a split replaced it since the snapshot.
    fn load(&self, id: SegmentId) -> IndexResult<Option<SegmentRef>> {
        match self.retry(|| self.registry.get_segment(id)) {
            Ok(segment) => Ok(Some(segment)),
            Err(Status::Error) if !self.map.snapshot().contains(id) => Ok(None),
            Err(Status::Error) if !self.registry.segment_exists(id) => Err(IndexError::corruption(
                format!("{id} is routed by the map but missing"),
            )),
            Err(Status::Error) => Err(IndexError::corruption(format!("{id} cannot be opened"))),
            Err(other) => Err(IndexError::from_status("check_consistency", Some(id), other, true)),
        }
    }

    /// Drops segment `id` if it is still empty once frozen.
    ///
    /// Returns false if a write landed after the check or a split replaced
    /// the segment meanwhile.
    fn remove_empty(&self, id: SegmentId, segment: &SegmentRef) -> IndexResult<bool> {
        let frozen = self.retry(|| {
            if segment.try_freeze() {
                Ok(())
            } else {
                Err(segment.state().rejection())
            }
        });
        match frozen {
            Ok(()) => {}
            Err(Status::Closed) => return Ok(false),
            Err(status) => {
                return Err(IndexError::from_status("remove_segment", Some(id), status, true))
            }
        }
        if segment.number_of_keys_in_cache() > 0 {
            segment.unfreeze();
            info!(segment_id = %id, "segment gained keys during repair, keeping it");
            return Ok(false);
        }

        let guard = match self.retry(|| self.registry.try_enter_freeze()) {
            Ok(guard) => guard,
            Err(status) => {
                segment.unfreeze();
                return Err(IndexError::from_status("remove_segment", Some(id), status, true));
            }
        };
        if !self.registry.is_segment_instance(id, segment) {
            // evicted since the check, writes may have gone to a reloaded instance
            drop(guard);
            segment.unfreeze();
            return Ok(false);
        }
        warn!(segment_id = %id, "removing empty segment");
        if !self.map.remove_segment(id, &guard) {
            guard.fail();
            segment.unfreeze();
            return Err(IndexError::corruption(format!(
                "{id} vanished from the map during repair"
            )));
        }
        self.registry.evict_segment_from_cache(id, segment);
        guard.finish();

        self.retry(|| self.registry.delete_segment(id))
            .map_err(|status| IndexError::from_status("remove_segment", Some(id), status, false))?;
        Ok(true)
    }

    fn extend_last(&self, key: &[u8]) -> IndexResult<()> {
        self.retry(|| {
            if self.map.try_extend_max_key(key, &self.map.snapshot()) {
                Ok(())
            } else {
                Err(Status::Busy)
            }
        })
        .map_err(|status| IndexError::from_status("extend_max_key", None, status, true))
    }

    fn retry<T>(&self, mut attempt: impl FnMut() -> StatusResult<T>) -> StatusResult<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match attempt() {
                Err(Status::Busy) if Instant::now() < deadline => std::thread::sleep(self.backoff),
                result => return result,
            }
        }
    }
}
