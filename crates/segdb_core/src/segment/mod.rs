//! Segment contract and the LSM reference implementation.
//!
//! A segment owns one contiguous key range. The index only talks to it
//! through [`Segment`]; every operation returns a [`StatusResult`] instead
//! of blocking on contention.

mod chunk;
mod lsm;

pub use lsm::{LsmSegment, LsmSegmentFactory};

use crate::error::IndexResult;
use crate::types::{SegmentId, Status, StatusResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle state of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    /// Accepting reads, writes and maintenance.
    Ready,
    /// A flush or compaction is running. Reads and writes continue.
    MaintenanceRunning,
    /// Held by a split. Writes and maintenance are rejected with BUSY.
    Freeze,
    /// A file operation failed. Every operation returns ERROR.
    Error,
    /// Closed. Every operation returns CLOSED.
    Closed,
}

impl SegmentState {
    /// Returns true if writes are accepted in this state.
    #[must_use]
    pub const fn accepts_writes(self) -> bool {
        matches!(self, Self::Ready | Self::MaintenanceRunning)
    }

    /// Maps a state that rejects an operation to the status reported.
    #[must_use]
    pub const fn rejection(self) -> Status {
        match self {
            Self::Closed => Status::Closed,
            Self::Error => Status::Error,
            Self::Ready | Self::MaintenanceRunning | Self::Freeze => Status::Busy,
        }
    }
}

/// Iterator isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isolation {
    /// Stops with BUSY once the segment changes structurally.
    FailFast,
    /// Stable snapshot, unaffected by later writes or maintenance.
    FullIsolation,
}

/// Contract every segment implementation provides to the index.
pub trait Segment: Send + Sync + fmt::Debug {
    /// Returns the segment id.
    fn id(&self) -> SegmentId;

    /// Returns the current state.
    fn state(&self) -> SegmentState;

    /// Reads the live value of `key`.
    fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>>;

    /// Writes `value` for `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> StatusResult<()>;

    /// Writes a tombstone for `key`.
    fn delete(&self, key: &[u8]) -> StatusResult<()>;

    /// Persists the write cache as a new delta file.
    fn flush(&self) -> StatusResult<()>;

    /// Merges the write cache, deltas and main file into a new main file.
    fn compact(&self) -> StatusResult<()>;

    /// Opens an ordered iterator over the live entries.
    fn open_iterator(&self, isolation: Isolation) -> StatusResult<SegmentIterator>;

    /// Makes every open fail-fast iterator stop.
    fn invalidate_iterators(&self);

    /// Verifies the segment files and returns the largest live key.
    ///
    /// `None` means the segment holds no live data.
    fn check_and_repair_consistency(&self) -> StatusResult<Option<Vec<u8>>>;

    /// Number of distinct live keys.
    fn number_of_keys_in_cache(&self) -> usize;

    /// Upper estimate of stored entries, counting overwrites and tombstones.
    fn estimated_number_of_keys(&self) -> usize;

    /// Number of entries in the write cache.
    fn write_cache_size(&self) -> usize;

    /// Number of delta files waiting for compaction.
    fn delta_file_count(&self) -> usize;

    /// Moves READY to FREEZE. Returns false in any other state.
    fn try_freeze(&self) -> bool;

    /// Moves FREEZE back to READY.
    fn unfreeze(&self);

    /// Persists pending writes and closes the segment.
    fn close(&self) -> StatusResult<()>;
}

/// Shared handle to a segment.
pub type SegmentRef = Arc<dyn Segment>;

/// Creates, opens and removes segments.
pub trait SegmentFactory: Send + Sync + fmt::Debug {
    /// Creates the files of a new empty segment and opens it.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    fn create(&self, id: SegmentId) -> IndexResult<SegmentRef>;

    /// Opens an existing segment. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the files exist but cannot be read.
    fn open(&self, id: SegmentId) -> IndexResult<Option<SegmentRef>>;

    /// Removes every file of a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be deleted.
    fn delete(&self, id: SegmentId) -> IndexResult<()>;

    /// Returns true if the segment has files.
    fn exists(&self, id: SegmentId) -> bool;

    /// Returns every segment id with files in the directory, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    fn list_segment_ids(&self) -> IndexResult<Vec<SegmentId>>;
}

/// Ordered iterator over segment entries.
///
/// Entries are captured when the iterator opens. A fail-fast iterator
/// additionally watches the segment generation and yields `Err(BUSY)` once
/// the segment was invalidated.
pub struct SegmentIterator {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    watch: Option<(Arc<AtomicU64>, u64)>,
    stopped: bool,
}

impl SegmentIterator {
    pub(crate) fn new(
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        isolation: Isolation,
        generation: &Arc<AtomicU64>,
    ) -> Self {
        let watch = match isolation {
            Isolation::FailFast => Some((
                Arc::clone(generation),
                generation.load(Ordering::Acquire),
            )),
            Isolation::FullIsolation => None,
        };
        Self {
            entries: entries.into_iter(),
            watch,
            stopped: false,
        }
    }

    /// Returns how many entries are left.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl Iterator for SegmentIterator {
    type Item = StatusResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if let Some((generation, opened_at)) = &self.watch {
            if generation.load(Ordering::Acquire) != *opened_at {
                self.stopped = true;
                return Some(Err(Status::Busy));
            }
        }
        self.entries.next().map(Ok)
    }
}

impl fmt::Debug for SegmentIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentIterator")
            .field("remaining", &self.entries.len())
            .field("fail_fast", &self.watch.is_some())
            .finish()
    }
}

/// Segments whose writes and consistency checks can run a one-shot callback,
/// standing in for a concurrent caller that acts at an exact point.
#[cfg(test)]
pub(crate) mod hooks {
    use super::*;
    use crate::error::IndexResult;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    type Hook = Box<dyn FnOnce(&dyn Segment) + Send>;

    /// Callbacks shared by every segment of one [`HookedFactory`].
    #[derive(Default)]
    pub(crate) struct Hooks {
        after_put: Mutex<Option<Hook>>,
        after_check: Mutex<Option<Hook>>,
        fail_next_close: AtomicBool,
    }

    impl Hooks {
        /// Runs `hook` once, right after the next successful put returns.
        pub(crate) fn after_put(&self, hook: impl FnOnce(&dyn Segment) + Send + 'static) {
            *self.after_put.lock() = Some(Box::new(hook));
        }

        /// Runs `hook` once, right after the next consistency check returns.
        pub(crate) fn after_check(&self, hook: impl FnOnce(&dyn Segment) + Send + 'static) {
            *self.after_check.lock() = Some(Box::new(hook));
        }

        /// Makes the next close of any segment fail with ERROR.
        pub(crate) fn fail_next_close(&self) {
            self.fail_next_close.store(true, Ordering::SeqCst);
        }

        fn fire(slot: &Mutex<Option<Hook>>, segment: &dyn Segment) {
            let hook = slot.lock().take();
            if let Some(hook) = hook {
                hook(segment);
            }
        }
    }

    impl fmt::Debug for Hooks {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Hooks").finish_non_exhaustive()
        }
    }

    #[derive(Debug)]
    struct HookedSegment {
        inner: SegmentRef,
        hooks: Arc<Hooks>,
    }

    impl Segment for HookedSegment {
        fn id(&self) -> SegmentId {
            self.inner.id()
        }

        fn state(&self) -> SegmentState {
            self.inner.state()
        }

        fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> StatusResult<()> {
            self.inner.put(key, value)?;
            Hooks::fire(&self.hooks.after_put, self);
            Ok(())
        }

        fn delete(&self, key: &[u8]) -> StatusResult<()> {
            self.inner.delete(key)
        }

        fn flush(&self) -> StatusResult<()> {
            self.inner.flush()
        }

        fn compact(&self) -> StatusResult<()> {
            self.inner.compact()
        }

        fn open_iterator(&self, isolation: Isolation) -> StatusResult<SegmentIterator> {
            self.inner.open_iterator(isolation)
        }

        fn invalidate_iterators(&self) {
            self.inner.invalidate_iterators();
        }

        fn check_and_repair_consistency(&self) -> StatusResult<Option<Vec<u8>>> {
            let result = self.inner.check_and_repair_consistency();
            Hooks::fire(&self.hooks.after_check, self);
            result
        }

        fn number_of_keys_in_cache(&self) -> usize {
            self.inner.number_of_keys_in_cache()
        }

        fn estimated_number_of_keys(&self) -> usize {
            self.inner.estimated_number_of_keys()
        }

        fn write_cache_size(&self) -> usize {
            self.inner.write_cache_size()
        }

        fn delta_file_count(&self) -> usize {
            self.inner.delta_file_count()
        }

        fn try_freeze(&self) -> bool {
            self.inner.try_freeze()
        }

        fn unfreeze(&self) {
            self.inner.unfreeze();
        }

        fn close(&self) -> StatusResult<()> {
            if self.hooks.fail_next_close.swap(false, Ordering::SeqCst) {
                return Err(Status::Error);
            }
            self.inner.close()
        }
    }

    /// Wraps every segment an [`LsmSegmentFactory`] hands out.
    #[derive(Debug)]
    pub(crate) struct HookedFactory {
        inner: LsmSegmentFactory,
        hooks: Arc<Hooks>,
    }

    impl HookedFactory {
        pub(crate) fn new(inner: LsmSegmentFactory) -> Self {
            Self {
                inner,
                hooks: Arc::new(Hooks::default()),
            }
        }

        pub(crate) fn hooks(&self) -> Arc<Hooks> {
            Arc::clone(&self.hooks)
        }

        fn wrap(&self, inner: SegmentRef) -> SegmentRef {
            Arc::new(HookedSegment {
                inner,
                hooks: Arc::clone(&self.hooks),
            })
        }
    }

    impl SegmentFactory for HookedFactory {
        fn create(&self, id: SegmentId) -> IndexResult<SegmentRef> {
            self.inner.create(id).map(|segment| self.wrap(segment))
        }

        fn open(&self, id: SegmentId) -> IndexResult<Option<SegmentRef>> {
            Ok(self.inner.open(id)?.map(|segment| self.wrap(segment)))
        }

        fn delete(&self, id: SegmentId) -> IndexResult<()> {
            self.inner.delete(id)
        }

        fn exists(&self, id: SegmentId) -> bool {
            self.inner.exists(id)
        }

        fn list_segment_ids(&self) -> IndexResult<Vec<SegmentId>> {
            self.inner.list_segment_ids()
        }
    }
}
