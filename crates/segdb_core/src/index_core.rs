//! Single-attempt index operations.
//!
//! Every method makes exactly one attempt against the current map snapshot
//! and returns a [`StatusResult`]. Nothing here sleeps or retries; BUSY tells
//! the caller that contention or a concurrent split got in the way and the
//! attempt is safe to repeat.

use crate::keymap::{KeySegmentMap, MapSnapshot};
use crate::maintenance::MaintenanceCoordinator;
use crate::registry::SegmentRegistry;
use crate::segment::SegmentRef;
use crate::stats::IndexStats;
use crate::types::{SegmentId, Status, StatusResult};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Stateless orchestration of point operations over the map and registry.
pub struct IndexCore {
    map: Arc<KeySegmentMap>,
    registry: Arc<SegmentRegistry>,
    maintenance: Arc<MaintenanceCoordinator>,
    stats: Arc<IndexStats>,
}

impl IndexCore {
    /// Creates the core.
    pub fn new(
        map: Arc<KeySegmentMap>,
        registry: Arc<SegmentRegistry>,
        maintenance: Arc<MaintenanceCoordinator>,
        stats: Arc<IndexStats>,
    ) -> Self {
        Self {
            map,
            registry,
            maintenance,
            stats,
        }
    }

    /// Returns the key map.
    pub fn map(&self) -> &Arc<KeySegmentMap> {
        &self.map
    }

    /// Returns the segment registry.
    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    /// Returns the maintenance coordinator.
    pub fn maintenance(&self) -> &Arc<MaintenanceCoordinator> {
        &self.maintenance
    }

    /// Reads `key`.
    pub fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>> {
        let snapshot = self.map.snapshot();
        let Some(id) = snapshot.find_segment_id(key) else {
            return Ok(None);
        };
        let segment = self.acquire(key, id, &snapshot)?;
        let value = segment.get(key).map_err(retry_closed)?;
        self.validate(key, id, &snapshot)?;
        self.stats.record_get();
        Ok(value)
    }

    /// Writes `value` for `key`.
    ///
    /// A BUSY result after the segment accepted the write means the key
    /// moved to another segment meanwhile; repeating the put writes it there.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StatusResult<()> {
        let mut snapshot = self.map.snapshot();
        if snapshot.is_empty() {
            self.bootstrap(key, &snapshot)?;
            snapshot = self.map.snapshot();
        }
        if snapshot.max_key().is_some_and(|max| key > max) {
            if !self.map.try_extend_max_key(key, &snapshot) {
                return Err(Status::Busy);
            }
            self.map.optionally_flush().map_err(|err| {
                error!(error = %err, "key map flush failed");
                Status::Error
            })?;
            snapshot = self.map.snapshot();
        }

        let Some(id) = snapshot.find_segment_id(key) else {
            return Err(Status::Busy);
        };
        let segment = self.acquire(key, id, &snapshot)?;
        segment.put(key, value).map_err(retry_closed)?;
        self.validate(key, id, &snapshot)?;
        self.stats.record_put();
        self.maintenance.after_write(&segment);
        Ok(())
    }

    /// Writes a tombstone for `key`. Keys no segment covers are left alone.
    pub fn delete(&self, key: &[u8]) -> StatusResult<()> {
        let snapshot = self.map.snapshot();
        let Some(id) = snapshot.find_segment_id(key) else {
            return Ok(());
        };
        let segment = self.acquire(key, id, &snapshot)?;
        segment.delete(key).map_err(retry_closed)?;
        self.validate(key, id, &snapshot)?;
        self.stats.record_delete();
        self.maintenance.after_write(&segment);
        Ok(())
    }

    /// Flushes the write cache of segment `id` and returns the segment.
    pub fn flush_segment(&self, id: SegmentId) -> StatusResult<SegmentRef> {
        let segment = self.registry.get_segment(id)?;
        segment.flush()?;
        self.stats.record_flush();
        Ok(segment)
    }

    /// Compacts segment `id` and returns the segment.
    pub fn compact_segment(&self, id: SegmentId) -> StatusResult<SegmentRef> {
        let segment = self.registry.get_segment(id)?;
        segment.compact()?;
        self.stats.record_compaction();
        Ok(segment)
    }

    /// Installs the first segment of an empty index.
    fn bootstrap(&self, key: &[u8], snapshot: &MapSnapshot) -> StatusResult<()> {
        let segment = self.registry.create_segment()?;
        let id = segment.id();
        if !self.map.try_insert_first_segment(key, id, snapshot) {
            drop(segment);
            debug!(segment_id = %id, "lost first segment race");
            if let Err(status) = self.registry.delete_segment(id) {
                debug!(segment_id = %id, %status, "could not delete unused first segment");
            }
            return Err(Status::Busy);
        }
        self.map.flush().map_err(|err| {
            error!(segment_id = %id, error = %err, "key map flush failed");
            Status::Error
        })
    }

    /// Acquires segment `id`.
    ///
    /// A segment that vanished because the key moved is BUSY, not ERROR.
    fn acquire(&self, key: &[u8], id: SegmentId, snapshot: &MapSnapshot) -> StatusResult<SegmentRef> {
        self.registry.get_segment(id).map_err(|status| match status {
            Status::Error if !self.map.is_mapping_valid(key, id, snapshot.version()) => Status::Busy,
            other => other,
        })
    }

    fn validate(&self, key: &[u8], id: SegmentId, snapshot: &MapSnapshot) -> StatusResult<()> {
        if self.map.is_mapping_valid(key, id, snapshot.version()) {
            Ok(())
        } else {
            debug!(segment_id = %id, "mapping moved during operation");
            Err(Status::Busy)
        }
    }
}

/// A segment closed under an operation was evicted or split away.
fn retry_closed(status: Status) -> Status {
    match status {
        Status::Closed => Status::Busy,
        other => other,
    }
}

impl fmt::Debug for IndexCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCore")
            .field("map_version", &self.map.version())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::IndexConfig;
    use crate::executor::ExecutorRegistry;
    use crate::maintenance::MaintenanceThresholds;
    use crate::segment::hooks::{HookedFactory, Hooks};
    use crate::segment::LsmSegmentFactory;
    use crate::split::{AsyncSplitCoordinator, SplitCoordinator};
    use segdb_storage::MemDirectory;
    use tracing::Span;

    /// Full coordination stack over an in-memory directory.
    pub(crate) struct Stack {
        pub dir: MemDirectory,
        pub core: IndexCore,
        pub splits: Arc<AsyncSplitCoordinator>,
        pub split_coordinator: Arc<SplitCoordinator>,
        pub stats: Arc<IndexStats>,
    }

    pub(crate) fn stack(config: &IndexConfig) -> Stack {
        let dir = MemDirectory::new();
        let registry = SegmentRegistry::for_tests(&dir);
        stack_over(dir, registry, config)
    }

    /// Stack whose segments run the callbacks armed on the returned hooks.
    pub(crate) fn hooked_stack(config: &IndexConfig) -> (Stack, Arc<Hooks>) {
        let dir = MemDirectory::new();
        let factory = HookedFactory::new(LsmSegmentFactory::new(Arc::new(dir.clone())));
        let hooks = factory.hooks();
        let registry = SegmentRegistry::with_factory(Arc::new(factory), config);
        (stack_over(dir, registry, config), hooks)
    }

    fn stack_over(dir: MemDirectory, registry: SegmentRegistry, config: &IndexConfig) -> Stack {
        let map = Arc::new(KeySegmentMap::open(Arc::new(dir.clone()), config.map_flush_batch).unwrap());
        let registry = Arc::new(registry);
        let stats = Arc::new(IndexStats::new());
        let executors = ExecutorRegistry::global();
        let split_coordinator = Arc::new(SplitCoordinator::new(
            Arc::clone(&map),
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.min_keys_to_split,
            config.busy_backoff,
            config.busy_timeout,
        ));
        let splits = Arc::new(AsyncSplitCoordinator::new(
            Arc::clone(&split_coordinator),
            executors.lease("segdb-test-split", 1, 256).unwrap(),
            Span::none(),
        ));
        let maintenance = Arc::new(MaintenanceCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&splits),
            executors.lease("segdb-test-maintenance", 1, 256).unwrap(),
            MaintenanceThresholds::from(config),
            Arc::clone(&stats),
            Span::none(),
        ));
        Stack {
            dir,
            core: IndexCore::new(map, registry, maintenance, Arc::clone(&stats)),
            splits,
            split_coordinator,
            stats,
        }
    }
}
