//! Segment registry: a bounded cache of open segments behind a gate.
//!
//! The gate is a small state machine (`READY`, `FREEZE`, `CLOSED`, `ERROR`)
//! whose transition functions return booleans. Segment acquisition only
//! proceeds while the gate is `READY`; a split holds `FREEZE` through a
//! [`FreezeGuard`] while it rewrites the key map.
//!
//! Loads are single-flight: the first caller for a cold id opens the
//! segment, later callers for the same id wait for that load and receive
//! the same instance. When the cache grows past its capacity the least
//! recently used segment that nobody holds is closed on the lifecycle pool.

use crate::config::IndexConfig;
use crate::executor::ExecutorLease;
use crate::segment::{SegmentFactory, SegmentRef};
use crate::stats::IndexStats;
use crate::types::{SegmentId, Status, StatusResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Span};

/// State of the registry gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateState {
    /// Segments may be acquired and evicted.
    Ready,
    /// A structural change is being applied. Acquisition returns BUSY.
    Freeze,
    /// Terminal. Acquisition returns CLOSED.
    Closed,
    /// Terminal fail-stop. Acquisition returns ERROR.
    Error,
}

impl GateState {
    /// Returns the status reported to callers blocked by this state.
    #[must_use]
    pub const fn rejection(self) -> Status {
        match self {
            Self::Ready | Self::Freeze => Status::Busy,
            Self::Closed => Status::Closed,
            Self::Error => Status::Error,
        }
    }
}

/// Registry gate with explicit transitions.
#[derive(Debug)]
struct Gate {
    state: Mutex<GateState>,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Ready),
        }
    }

    fn state(&self) -> GateState {
        *self.state.lock()
    }

    fn transition(&self, from: &[GateState], to: GateState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&state) {
            *state = to;
            true
        } else {
            false
        }
    }

    fn try_enter_freeze(&self) -> bool {
        self.transition(&[GateState::Ready], GateState::Freeze)
    }

    fn finish_freeze_to_ready(&self) -> bool {
        self.transition(&[GateState::Freeze], GateState::Ready)
    }

    fn fail(&self) -> bool {
        self.transition(&[GateState::Ready, GateState::Freeze], GateState::Error)
    }

    fn close(&self) -> bool {
        self.transition(&[GateState::Ready, GateState::Freeze], GateState::Closed)
    }
}

/// Exclusive permission to change the segment layout.
///
/// Only [`SegmentRegistry::try_enter_freeze`] creates one, and the key map
/// only accepts structural changes when given one, so the registry gate is
/// always taken before the map lock. Dropping the guard returns the gate to
/// `READY`; [`FreezeGuard::fail`] moves it to `ERROR` instead.
pub struct FreezeGuard<'a> {
    registry: &'a SegmentRegistry,
    released: bool,
}

impl FreezeGuard<'_> {
    /// Puts the registry into the fail-stop ERROR state.
    pub fn fail(mut self) {
        self.released = true;
        self.registry.fail();
    }

    /// Returns the gate to READY.
    pub fn finish(mut self) {
        self.released = true;
        self.registry.gate.finish_freeze_to_ready();
    }
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.registry.gate.finish_freeze_to_ready();
        }
    }
}

impl fmt::Debug for FreezeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreezeGuard").finish_non_exhaustive()
    }
}

struct LoadCell {
    result: Mutex<Option<StatusResult<SegmentRef>>>,
    done: Condvar,
}

impl LoadCell {
    fn wait(&self) -> StatusResult<SegmentRef> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn publish(&self, value: StatusResult<SegmentRef>) {
        *self.result.lock() = Some(value);
        self.done.notify_all();
    }
}

enum Slot {
    Loading(Arc<LoadCell>),
    Ready { segment: SegmentRef, last_access: u64 },
    Unloading,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<SegmentId, Slot>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    /// Picks the least recently used segment only the cache references.
    fn eviction_candidate(&self, keep: SegmentId) -> Option<SegmentId> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Ready {
                    segment,
                    last_access,
                } if *id != keep && Arc::strong_count(segment) == 1 => Some((*last_access, *id)),
                _ => None,
            })
            .min()
            .map(|(_, id)| id)
    }
}

fn same_instance(a: &SegmentRef, b: &SegmentRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Bounded cache of open segments keyed by id.
pub struct SegmentRegistry {
    factory: Arc<dyn SegmentFactory>,
    gate: Gate,
    cache: Arc<Mutex<CacheState>>,
    capacity: usize,
    next_id: AtomicU64,
    lifecycle: ExecutorLease,
    stats: Arc<IndexStats>,
    close_timeout: Duration,
    span: Span,
}

impl SegmentRegistry {
    /// Creates a registry that allocates ids from `first_free_id` onwards.
    pub fn new(
        factory: Arc<dyn SegmentFactory>,
        config: &IndexConfig,
        lifecycle: ExecutorLease,
        stats: Arc<IndexStats>,
        span: Span,
        first_free_id: SegmentId,
    ) -> Self {
        Self {
            factory,
            gate: Gate::new(),
            cache: Arc::new(Mutex::new(CacheState::default())),
            capacity: config.max_number_of_segments_in_cache.max(1),
            next_id: AtomicU64::new(first_free_id.as_u64().max(SegmentId::FIRST.as_u64())),
            lifecycle,
            stats,
            close_timeout: config.busy_timeout,
            span,
        }
    }

    /// Returns the gate state.
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Returns the number of open segments held by the cache.
    pub fn cached_segments(&self) -> usize {
        self.cache.lock().ready_count()
    }

    /// Returns the segment factory.
    pub fn factory(&self) -> &Arc<dyn SegmentFactory> {
        &self.factory
    }

    /// Acquires segment `id`, loading it if it is not cached.
    ///
    /// Returns BUSY while the gate is frozen or the segment is being
    /// unloaded, CLOSED/ERROR when the gate is terminal, and ERROR if the
    /// segment cannot be opened.
    pub fn get_segment(&self, id: SegmentId) -> StatusResult<SegmentRef> {
        let gate = self.gate.state();
        if gate != GateState::Ready {
            return Err(gate.rejection());
        }

        let cell = {
            let mut cache = self.cache.lock();
            let now = cache.tick();
            match cache.slots.get_mut(&id) {
                Some(Slot::Ready {
                    segment,
                    last_access,
                }) => {
                    *last_access = now;
                    return Ok(Arc::clone(segment));
                }
                Some(Slot::Unloading) => return Err(Status::Busy),
                Some(Slot::Loading(cell)) => {
                    let cell = Arc::clone(cell);
                    drop(cache);
                    return cell.wait();
                }
                None => {
                    let cell = Arc::new(LoadCell {
                        result: Mutex::new(None),
                        done: Condvar::new(),
                    });
                    cache.slots.insert(id, Slot::Loading(Arc::clone(&cell)));
                    cell
                }
            }
        };

        let loaded = match self.factory.open(id) {
            Ok(Some(segment)) => {
                self.stats.record_segment_load();
                debug!(segment_id = %id, "segment loaded");
                Ok(segment)
            }
            Ok(None) => {
                debug!(segment_id = %id, "segment does not exist");
                Err(Status::Error)
            }
            Err(err) => {
                error!(segment_id = %id, error = %err, "segment load failed");
                Err(Status::Error)
            }
        };

        let victims = {
            let mut cache = self.cache.lock();
            match &loaded {
                Ok(segment) => {
                    let now = cache.tick();
                    cache.slots.insert(
                        id,
                        Slot::Ready {
                            segment: Arc::clone(segment),
                            last_access: now,
                        },
                    );
                    Self::take_over_capacity(&mut cache, self.capacity, id)
                }
                Err(_) => {
                    cache.slots.remove(&id);
                    Vec::new()
                }
            }
        };
        cell.publish(loaded.clone());
        self.schedule_unloads(victims);
        loaded
    }

    /// Allocates a fresh id and creates an empty segment for it.
    ///
    /// Allowed while the gate is READY or FROZEN so a split can prepare its
    /// replacement segments.
    pub fn create_segment(&self) -> StatusResult<SegmentRef> {
        let gate = self.gate.state();
        if !matches!(gate, GateState::Ready | GateState::Freeze) {
            return Err(gate.rejection());
        }

        let id = SegmentId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let segment = self.factory.create(id).map_err(|err| {
            error!(segment_id = %id, error = %err, "segment creation failed");
            Status::Error
        })?;

        let victims = {
            let mut cache = self.cache.lock();
            let now = cache.tick();
            cache.slots.insert(
                id,
                Slot::Ready {
                    segment: Arc::clone(&segment),
                    last_access: now,
                },
            );
            Self::take_over_capacity(&mut cache, self.capacity, id)
        };
        self.schedule_unloads(victims);
        debug!(segment_id = %id, "segment allocated");
        Ok(segment)
    }

    /// Closes segment `id` if cached and removes its files.
    pub fn delete_segment(&self, id: SegmentId) -> StatusResult<()> {
        let cached = {
            let mut cache = self.cache.lock();
            match cache.slots.get(&id) {
                Some(Slot::Loading(_) | Slot::Unloading) => return Err(Status::Busy),
                Some(Slot::Ready { .. }) => match cache.slots.remove(&id) {
                    Some(Slot::Ready { segment, .. }) => Some(segment),
                    _ => None,
                },
                None => None,
            }
        };
        if let Some(segment) = cached {
            segment.invalidate_iterators();
            self.close_segment(&segment);
        }
        self.factory.delete(id).map_err(|err| {
            error!(segment_id = %id, error = %err, "segment deletion failed");
            Status::Error
        })
    }

    /// Returns true if `segment` is the instance currently cached for `id`.
    pub fn is_segment_instance(&self, id: SegmentId, segment: &SegmentRef) -> bool {
        matches!(
            self.cache.lock().slots.get(&id),
            Some(Slot::Ready { segment: cached, .. }) if same_instance(cached, segment)
        )
    }

    /// Removes `segment` from the cache and closes it.
    ///
    /// Returns false if a different instance (or none) is cached for `id`.
    pub fn evict_segment_from_cache(&self, id: SegmentId, segment: &SegmentRef) -> bool {
        {
            let mut cache = self.cache.lock();
            let matches = matches!(
                cache.slots.get(&id),
                Some(Slot::Ready { segment: cached, .. }) if same_instance(cached, segment)
            );
            if !matches {
                return false;
            }
            cache.slots.insert(id, Slot::Unloading);
        }
        segment.invalidate_iterators();
        self.close_segment(segment);
        self.cache.lock().slots.remove(&id);
        self.stats.record_segment_eviction();
        debug!(segment_id = %id, "segment evicted");
        true
    }

    /// Enters FREEZE, returning the guard that leaves it.
    ///
    /// Fails with BUSY if another structural change holds the gate.
    pub fn try_enter_freeze(&self) -> Result<FreezeGuard<'_>, Status> {
        if self.gate.try_enter_freeze() {
            Ok(FreezeGuard {
                registry: self,
                released: false,
            })
        } else {
            Err(self.gate.state().rejection())
        }
    }

    /// Returns a frozen gate to READY.
    pub fn finish_freeze_to_ready(&self) -> bool {
        self.gate.finish_freeze_to_ready()
    }

    /// Moves the gate to ERROR. Further acquisitions fail.
    pub fn fail(&self) {
        if self.gate.fail() {
            error!("segment registry entered ERROR state");
        }
    }

    /// Moves the gate to CLOSED and closes every cached segment.
    pub fn close(&self) {
        let was_open = self.gate.close();
        let segments: Vec<SegmentRef> = {
            let mut cache = self.cache.lock();
            cache
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready { segment, .. } => Some(segment),
                    _ => None,
                })
                .collect()
        };
        for segment in &segments {
            self.close_segment(segment);
        }
        if was_open {
            info!(segments = segments.len(), "segment registry closed");
        }
    }

    /// Returns true if `id` is cached or has files.
    pub fn segment_exists(&self, id: SegmentId) -> bool {
        matches!(self.cache.lock().slots.get(&id), Some(Slot::Ready { .. }))
            || self.factory.exists(id)
    }

    /// Marks cached segments beyond capacity as unloading and returns them.
    fn take_over_capacity(cache: &mut CacheState, capacity: usize, keep: SegmentId) -> Vec<PendingUnload> {
        let mut victims = Vec::new();
        while cache.ready_count() > capacity {
            let Some(victim) = cache.eviction_candidate(keep) else {
                // every cached segment is in use
                break;
            };
            if let Some(Slot::Ready { segment, .. }) = cache.slots.insert(victim, Slot::Unloading) {
                victims.push(PendingUnload {
                    id: victim,
                    segment,
                });
            }
        }
        victims
    }

    fn schedule_unloads(&self, victims: Vec<PendingUnload>) {
        for victim in victims {
            self.stats.record_segment_eviction();
            let task = UnloadTask {
                cache: Arc::clone(&self.cache),
                id: victim.id,
                segment: victim.segment,
                timeout: self.close_timeout,
                span: self.span.clone(),
            };
            let fallback = task.clone();
            if let Err(err) = self.lifecycle.submit(move || task.run()) {
                warn!(segment_id = %victim.id, error = %err, "closing evicted segment inline");
                fallback.run();
            }
        }
    }

    fn close_segment(&self, segment: &SegmentRef) {
        if !close_with_retry(segment, self.close_timeout) {
            warn!(segment_id = %segment.id(), "segment did not close cleanly");
        }
    }
}

struct PendingUnload {
    id: SegmentId,
    segment: SegmentRef,
}

/// Closes an evicted segment and clears its slot.
#[derive(Clone)]
struct UnloadTask {
    cache: Arc<Mutex<CacheState>>,
    id: SegmentId,
    segment: SegmentRef,
    timeout: Duration,
    span: Span,
}

impl UnloadTask {
    fn run(self) {
        let _entered = self.span.enter();
        if !close_with_retry(&self.segment, self.timeout) {
            warn!(segment_id = %self.id, "evicted segment did not close cleanly");
        }
        let mut cache = self.cache.lock();
        if matches!(cache.slots.get(&self.id), Some(Slot::Unloading)) {
            cache.slots.remove(&self.id);
        }
        debug!(segment_id = %self.id, "segment unloaded");
    }
}

/// Closes `segment`, retrying while maintenance keeps it busy.
fn close_with_retry(segment: &SegmentRef, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match segment.close() {
            Ok(()) | Err(Status::Closed) => return true,
            Err(Status::Error) => return false,
            Err(Status::Busy) => {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

impl fmt::Debug for SegmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentRegistry")
            .field("gate", &self.gate.state())
            .field("capacity", &self.capacity)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl SegmentRegistry {
    /// Registry over an in-memory directory with default settings.
    pub(crate) fn for_tests(dir: &segdb_storage::MemDirectory) -> Self {
        let factory = Arc::new(crate::segment::LsmSegmentFactory::new(Arc::new(dir.clone())));
        Self::with_factory(factory, &IndexConfig::default())
    }

    pub(crate) fn with_factory(factory: Arc<dyn SegmentFactory>, config: &IndexConfig) -> Self {
        let first_free = factory
            .list_segment_ids()
            .ok()
            .and_then(|ids| ids.last().copied())
            .map_or(SegmentId::FIRST, SegmentId::next);
        let lifecycle = crate::executor::ExecutorRegistry::global()
            .lease("segdb-test-lifecycle", 1, 256)
            .unwrap();
        Self::new(
            factory,
            config,
            lifecycle,
            Arc::new(IndexStats::new()),
            Span::none(),
            first_free,
        )
    }
}
