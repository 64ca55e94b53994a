//! LSM segment: write cache, delta files and a compacted main file.

use super::chunk::{self, ChunkEntries};
use super::{Isolation, Segment, SegmentFactory, SegmentIterator, SegmentRef, SegmentState};
use crate::error::{IndexError, IndexResult};
use crate::types::{SegmentId, Status, StatusResult};
use parking_lot::RwLock;
use segdb_storage::{Directory, StorageError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

fn main_file(id: SegmentId) -> String {
    format!("{id}.main")
}

fn delta_file(id: SegmentId, seq: u64) -> String {
    format!("{id}.delta-{seq:05}")
}

fn delta_prefix(id: SegmentId) -> String {
    format!("{id}.delta-")
}

/// Parses `segment-<id>.<suffix>` into the id.
fn parse_segment_file(name: &str) -> Option<SegmentId> {
    let rest = name.strip_prefix("segment-")?;
    let (id, _suffix) = rest.split_once('.')?;
    id.parse().ok().map(SegmentId::new)
}

struct LsmInner {
    state: SegmentState,
    main: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Flushed deltas, oldest first.
    deltas: Vec<(u64, ChunkEntries)>,
    /// Write cache taken by a running flush or compaction, still readable.
    in_flight: Option<ChunkEntries>,
    write_cache: ChunkEntries,
    live_keys: usize,
    next_delta: u64,
}

impl LsmInner {
    /// Resolves `key` through every layer, newest first.
    fn lookup(&self, key: &[u8]) -> Option<&Vec<u8>> {
        if let Some(value) = self.write_cache.get(key) {
            return value.as_ref();
        }
        if let Some(value) = self.in_flight.as_ref().and_then(|c| c.get(key)) {
            return value.as_ref();
        }
        for (_, delta) in self.deltas.iter().rev() {
            if let Some(value) = delta.get(key) {
                return value.as_ref();
            }
        }
        self.main.get(key)
    }

    /// Merges every layer into the live view.
    fn live_view(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut merged: ChunkEntries = self
            .main
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        let layers = self
            .deltas
            .iter()
            .map(|(_, d)| d)
            .chain(self.in_flight.iter())
            .chain(std::iter::once(&self.write_cache));
        for layer in layers {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }

    fn write(&mut self, key: &[u8], value: Option<&[u8]>) {
        let was_live = self.lookup(key).is_some();
        match (was_live, value.is_some()) {
            (false, true) => self.live_keys += 1,
            (true, false) => self.live_keys -= 1,
            _ => {}
        }
        self.write_cache.insert(key.to_vec(), value.map(<[u8]>::to_vec));
    }

    fn estimated_keys(&self) -> usize {
        self.main.len()
            + self.deltas.iter().map(|(_, d)| d.len()).sum::<usize>()
            + self.in_flight.as_ref().map_or(0, BTreeMap::len)
            + self.write_cache.len()
    }

    /// Puts a failed in-flight cache back under newer writes.
    fn restore_in_flight(&mut self) {
        if let Some(cache) = self.in_flight.take() {
            for (k, v) in cache {
                self.write_cache.entry(k).or_insert(v);
            }
        }
    }
}

/// Reference segment stored as chunk files in a [`Directory`].
///
/// Writes land in an in-memory write cache. [`Segment::flush`] turns the
/// cache into a delta file, [`Segment::compact`] folds everything into the
/// main file and drops tombstones. File I/O happens outside the state lock,
/// so reads and writes continue while maintenance runs.
pub struct LsmSegment {
    id: SegmentId,
    directory: Arc<dyn Directory>,
    inner: RwLock<LsmInner>,
    generation: Arc<AtomicU64>,
}

impl LsmSegment {
    fn from_parts(
        id: SegmentId,
        directory: Arc<dyn Directory>,
        main: BTreeMap<Vec<u8>, Vec<u8>>,
        deltas: Vec<(u64, ChunkEntries)>,
    ) -> Self {
        let next_delta = deltas.last().map_or(1, |(seq, _)| seq + 1);
        let mut inner = LsmInner {
            state: SegmentState::Ready,
            main,
            deltas,
            in_flight: None,
            write_cache: BTreeMap::new(),
            live_keys: 0,
            next_delta,
        };
        inner.live_keys = inner.live_view().len();
        Self {
            id,
            directory,
            inner: RwLock::new(inner),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn fail(&self, inner: &mut LsmInner, operation: &str, err: &StorageError) {
        error!(segment_id = %self.id, operation, error = %err, "segment file operation failed");
        inner.state = SegmentState::Error;
        self.bump_generation();
    }

    /// Checks a state that must be READY before maintenance may start.
    fn begin_maintenance(inner: &mut LsmInner) -> StatusResult<()> {
        if inner.state != SegmentState::Ready {
            return Err(inner.state.rejection());
        }
        inner.state = SegmentState::MaintenanceRunning;
        Ok(())
    }

    /// Writes the cache to a new delta and moves the segment to `done`.
    fn write_cache_to_delta(&self, done: SegmentState) -> StatusResult<()> {
        let (seq, bytes) = {
            let mut inner = self.inner.write();
            if inner.write_cache.is_empty() {
                inner.state = done;
                return Ok(());
            }
            let bytes = match chunk::encode(&inner.write_cache) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(segment_id = %self.id, error = %err, "cannot encode write cache");
                    inner.state = done;
                    return Err(Status::Error);
                }
            };
            let cache = std::mem::take(&mut inner.write_cache);
            inner.in_flight = Some(cache);
            let seq = inner.next_delta;
            inner.next_delta += 1;
            (seq, bytes)
        };

        let written = self.directory.write_file(&delta_file(self.id, seq), &bytes);

        let mut inner = self.inner.write();
        match written {
            Ok(()) => {
                if let Some(cache) = inner.in_flight.take() {
                    inner.deltas.push((seq, cache));
                }
                inner.state = done;
                debug!(segment_id = %self.id, delta = seq, "write cache flushed");
                Ok(())
            }
            Err(err) => {
                inner.restore_in_flight();
                self.fail(&mut inner, "flush", &err);
                Err(Status::Error)
            }
        }
    }
}

impl Segment for LsmSegment {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn state(&self) -> SegmentState {
        self.inner.read().state
    }

    fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>> {
        let inner = self.inner.read();
        match inner.state {
            SegmentState::Closed => Err(Status::Closed),
            SegmentState::Error => Err(Status::Error),
            _ => Ok(inner.lookup(key).cloned()),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StatusResult<()> {
        let mut inner = self.inner.write();
        if !inner.state.accepts_writes() {
            return Err(inner.state.rejection());
        }
        inner.write(key, Some(value));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StatusResult<()> {
        let mut inner = self.inner.write();
        if !inner.state.accepts_writes() {
            return Err(inner.state.rejection());
        }
        inner.write(key, None);
        Ok(())
    }

    fn flush(&self) -> StatusResult<()> {
        Self::begin_maintenance(&mut self.inner.write())?;
        self.write_cache_to_delta(SegmentState::Ready)
    }

    fn compact(&self) -> StatusResult<()> {
        let (merged, delta_seqs) = {
            let mut inner = self.inner.write();
            Self::begin_maintenance(&mut inner)?;
            let cache = std::mem::take(&mut inner.write_cache);
            inner.in_flight = Some(cache);
            let seqs: Vec<u64> = inner.deltas.iter().map(|(seq, _)| *seq).collect();
            // writes arriving from here on stay in the new write cache
            (inner.live_view(), seqs)
        };

        let entries: ChunkEntries = merged
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        let bytes = match chunk::encode(&entries) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(segment_id = %self.id, error = %err, "cannot encode compacted segment");
                let mut inner = self.inner.write();
                inner.restore_in_flight();
                inner.state = SegmentState::Ready;
                return Err(Status::Error);
            }
        };
        let written = self.directory.write_file(&main_file(self.id), &bytes);

        let mut inner = self.inner.write();
        if let Err(err) = written {
            inner.restore_in_flight();
            self.fail(&mut inner, "compact", &err);
            return Err(Status::Error);
        }
        inner.main = merged;
        inner.deltas.retain(|(seq, _)| !delta_seqs.contains(seq));
        inner.in_flight = None;
        inner.state = SegmentState::Ready;
        drop(inner);
        self.bump_generation();

        for seq in &delta_seqs {
            if let Err(err) = self.directory.delete_file(&delta_file(self.id, *seq)) {
                // the new main file already shadows the delta
                warn!(segment_id = %self.id, delta = seq, error = %err, "failed to delete compacted delta");
            }
        }
        debug!(segment_id = %self.id, deltas = delta_seqs.len(), "segment compacted");
        Ok(())
    }

    fn open_iterator(&self, isolation: Isolation) -> StatusResult<SegmentIterator> {
        let inner = self.inner.read();
        match inner.state {
            SegmentState::Closed => Err(Status::Closed),
            SegmentState::Error => Err(Status::Error),
            _ => Ok(SegmentIterator::new(
                inner.live_view().into_iter().collect(),
                isolation,
                &self.generation,
            )),
        }
    }

    fn invalidate_iterators(&self) {
        self.bump_generation();
    }

    fn check_and_repair_consistency(&self) -> StatusResult<Option<Vec<u8>>> {
        let inner = self.inner.read();
        match inner.state {
            SegmentState::Closed => return Err(Status::Closed),
            SegmentState::Error => return Err(Status::Error),
            _ => {}
        }

        let mut files = vec![main_file(self.id)];
        files.extend(inner.deltas.iter().map(|(seq, _)| delta_file(self.id, *seq)));
        for name in &files {
            match self.directory.read_file(name) {
                Ok(bytes) => {
                    if let Err(err) = chunk::decode(&bytes) {
                        error!(segment_id = %self.id, file = %name, error = %err, "corrupted segment file");
                        return Err(Status::Error);
                    }
                }
                Err(StorageError::NotFound(_)) if name == &files[0] => {
                    warn!(segment_id = %self.id, "main file missing, rewriting it");
                    let entries: ChunkEntries = inner
                        .main
                        .iter()
                        .map(|(k, v)| (k.clone(), Some(v.clone())))
                        .collect();
                    let rewritten = chunk::encode(&entries).and_then(|bytes| {
                        self.directory.write_file(name, &bytes).map_err(Into::into)
                    });
                    if let Err(err) = rewritten {
                        error!(segment_id = %self.id, error = %err, "failed to rewrite main file");
                        return Err(Status::Error);
                    }
                }
                Err(err) => {
                    error!(segment_id = %self.id, file = %name, error = %err, "unreadable segment file");
                    return Err(Status::Error);
                }
            }
        }

        Ok(inner.live_view().into_keys().next_back())
    }

    fn number_of_keys_in_cache(&self) -> usize {
        self.inner.read().live_keys
    }

    fn estimated_number_of_keys(&self) -> usize {
        self.inner.read().estimated_keys()
    }

    fn write_cache_size(&self) -> usize {
        self.inner.read().write_cache.len()
    }

    fn delta_file_count(&self) -> usize {
        self.inner.read().deltas.len()
    }

    fn try_freeze(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.state == SegmentState::Ready {
            inner.state = SegmentState::Freeze;
            true
        } else {
            false
        }
    }

    fn unfreeze(&self) {
        let mut inner = self.inner.write();
        if inner.state == SegmentState::Freeze {
            inner.state = SegmentState::Ready;
        }
    }

    fn close(&self) -> StatusResult<()> {
        {
            let mut inner = self.inner.write();
            match inner.state {
                SegmentState::Closed => return Ok(()),
                SegmentState::MaintenanceRunning => return Err(Status::Busy),
                SegmentState::Error => {
                    inner.state = SegmentState::Closed;
                    drop(inner);
                    self.bump_generation();
                    return Ok(());
                }
                SegmentState::Ready | SegmentState::Freeze => {
                    // rejects writes until the final flush is done
                    inner.state = SegmentState::Freeze;
                }
            }
        }

        self.write_cache_to_delta(SegmentState::Closed)?;
        self.bump_generation();
        debug!(segment_id = %self.id, "segment closed");
        Ok(())
    }
}

impl fmt::Debug for LsmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("LsmSegment")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("live_keys", &inner.live_keys)
            .field("deltas", &inner.deltas.len())
            .finish_non_exhaustive()
    }
}

/// Creates [`LsmSegment`]s inside one directory.
#[derive(Debug, Clone)]
pub struct LsmSegmentFactory {
    directory: Arc<dyn Directory>,
}

impl LsmSegmentFactory {
    /// Creates a factory over `directory`.
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    fn segment_files(&self, id: SegmentId) -> IndexResult<Vec<String>> {
        Ok(self
            .directory
            .list_files()?
            .into_iter()
            .filter(|name| parse_segment_file(name) == Some(id))
            .collect())
    }
}

impl SegmentFactory for LsmSegmentFactory {
    fn create(&self, id: SegmentId) -> IndexResult<SegmentRef> {
        if self.exists(id) {
            return Err(IndexError::invalid_argument(format!("{id} already exists")));
        }
        self.directory
            .write_file(&main_file(id), &chunk::encode(&BTreeMap::new())?)?;
        debug!(segment_id = %id, "segment created");
        Ok(Arc::new(LsmSegment::from_parts(
            id,
            Arc::clone(&self.directory),
            BTreeMap::new(),
            Vec::new(),
        )))
    }

    fn open(&self, id: SegmentId) -> IndexResult<Option<SegmentRef>> {
        let main = match self.directory.read_file(&main_file(id)) {
            Ok(bytes) => chunk::decode(&bytes)?,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let main = main
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();

        let prefix = delta_prefix(id);
        let mut deltas = Vec::new();
        for name in self.directory.list_files()? {
            let Some(seq) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            deltas.push((seq, chunk::decode(&self.directory.read_file(&name)?)?));
        }
        deltas.sort_by_key(|(seq, _)| *seq);

        Ok(Some(Arc::new(LsmSegment::from_parts(
            id,
            Arc::clone(&self.directory),
            main,
            deltas,
        ))))
    }

    fn delete(&self, id: SegmentId) -> IndexResult<()> {
        for name in self.segment_files(id)? {
            self.directory.delete_file(&name)?;
        }
        debug!(segment_id = %id, "segment files deleted");
        Ok(())
    }

    fn exists(&self, id: SegmentId) -> bool {
        self.directory.file_exists(&main_file(id))
    }

    fn list_segment_ids(&self) -> IndexResult<Vec<SegmentId>> {
        let mut ids: Vec<SegmentId> = self
            .directory
            .list_files()?
            .iter()
            .filter_map(|name| parse_segment_file(name))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
