//! Key-to-segment map.
//!
//! A sorted list of `(max key, segment id)` entries: key `k` belongs to the
//! first entry whose max key is `>= k`. The live map is an immutable
//! [`MapSnapshot`] behind an `Arc` that writers replace wholesale, so a
//! reader always sees either the complete old or the complete new routing.
//! Every structural change bumps the snapshot version, which lets
//! single-attempt operations detect a concurrent split.
//!
//! ## File format (`index.map`)
//!
//! ```text
//! magic "SGMP" | version u16 | count u32 | entries... | crc32 u32
//! entry: key_len u32 | key | segment_id u64
//! ```

use crate::error::{IndexError, IndexResult};
use crate::registry::FreezeGuard;
use crate::split::{SplitApplyPlan, SplitStatus};
use crate::types::SegmentId;
use parking_lot::{Mutex, RwLock};
use segdb_storage::{Directory, StorageError};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the persisted map file.
pub const MAP_FILE: &str = "index.map";

const MAGIC: &[u8; 4] = b"SGMP";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 10;
/// Key length prefix plus segment id, for an empty key.
const MIN_ENTRY_LEN: usize = 12;

/// Immutable view of the map at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapSnapshot {
    entries: Vec<(Vec<u8>, SegmentId)>,
    version: u64,
}

impl MapSnapshot {
    /// Returns the version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the entries in key order.
    pub fn entries(&self) -> &[(Vec<u8>, SegmentId)] {
        &self.entries
    }

    /// Returns the number of segments routed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no segment exists yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves the segment owning `key`.
    ///
    /// Returns `None` for keys beyond the largest max key.
    pub fn find_segment_id(&self, key: &[u8]) -> Option<SegmentId> {
        let pos = self
            .entries
            .partition_point(|(max_key, _)| max_key.as_slice() < key);
        self.entries.get(pos).map(|(_, id)| *id)
    }

    /// Returns the max key of the last entry.
    pub fn max_key(&self) -> Option<&[u8]> {
        self.entries.last().map(|(key, _)| key.as_slice())
    }

    /// Returns the persisted max key of `id`.
    pub fn max_key_of(&self, id: SegmentId) -> Option<&[u8]> {
        self.position_of(id).map(|pos| self.entries[pos].0.as_slice())
    }

    /// Returns true if `id` is routed by this snapshot.
    pub fn contains(&self, id: SegmentId) -> bool {
        self.position_of(id).is_some()
    }

    /// Returns the routed segment ids in key order.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.entries.iter().map(|(_, id)| *id).collect()
    }

    /// Returns the largest routed segment id.
    pub fn max_segment_id(&self) -> Option<SegmentId> {
        self.entries.iter().map(|(_, id)| *id).max()
    }

    fn position_of(&self, id: SegmentId) -> Option<usize> {
        self.entries.iter().position(|(_, entry)| *entry == id)
    }

    fn encode(&self) -> IndexResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN
                + self
                    .entries
                    .iter()
                    .map(|(k, _)| MIN_ENTRY_LEN + k.len())
                    .sum::<usize>()
                + 4,
        );
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&length_prefix(self.entries.len(), "entry count")?.to_le_bytes());
        for (key, id) in &self.entries {
            buf.extend_from_slice(&length_prefix(key.len(), "key")?.to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&id.as_u64().to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode(data: &[u8]) -> IndexResult<Vec<(Vec<u8>, SegmentId)>> {
        if data.len() < HEADER_LEN + 4 || &data[..4] != MAGIC {
            return Err(IndexError::corruption("index.map has no valid header"));
        }
        let body_len = data.len() - 4;
        let stored = u32::from_le_bytes([
            data[body_len],
            data[body_len + 1],
            data[body_len + 2],
            data[body_len + 3],
        ]);
        if stored != crc32fast::hash(&data[..body_len]) {
            return Err(IndexError::corruption("index.map checksum mismatch"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != FORMAT_VERSION {
            return Err(IndexError::corruption(format!(
                "unsupported index.map version {version}"
            )));
        }

        let count = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        let body = &data[..body_len];
        let mut pos = HEADER_LEN;
        // the count is untrusted until the entries are read
        let mut entries = Vec::with_capacity(count.min((body_len - HEADER_LEN) / MIN_ENTRY_LEN));
        let truncated = || IndexError::corruption("truncated index.map entry");
        for _ in 0..count {
            let len_bytes = body.get(pos..pos + 4).ok_or_else(truncated)?;
            let key_len =
                u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                    as usize;
            pos += 4;
            let key = body
                .get(pos..pos.saturating_add(key_len))
                .ok_or_else(truncated)?
                .to_vec();
            pos += key_len;
            let id_bytes: [u8; 8] = body
                .get(pos..pos + 8)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(truncated)?;
            pos += 8;
            entries.push((key, SegmentId::new(u64::from_le_bytes(id_bytes))));
        }
        if pos != body_len {
            return Err(IndexError::corruption("trailing bytes in index.map"));
        }

        for pair in entries.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(IndexError::corruption("index.map entries are not sorted"));
            }
        }
        let mut ids: Vec<SegmentId> = entries.iter().map(|(_, id)| *id).collect();
        ids.sort();
        if ids.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(IndexError::corruption("index.map routes one segment twice"));
        }
        Ok(entries)
    }
}

fn length_prefix(len: usize, field: &str) -> IndexResult<u32> {
    u32::try_from(len).map_err(|_| {
        IndexError::invalid_argument(format!("index.map {field} of {len} exceeds the u32 limit"))
    })
}

/// Persisted, versioned routing table of one index.
#[derive(Debug)]
pub struct KeySegmentMap {
    directory: Arc<dyn Directory>,
    current: RwLock<Arc<MapSnapshot>>,
    /// Serializes writers. Readers never take it.
    write_lock: Mutex<WriteState>,
    flush_batch: usize,
}

#[derive(Debug, Default)]
struct WriteState {
    /// Changes not yet written to `index.map`.
    pending: usize,
}

impl KeySegmentMap {
    /// Loads `index.map` from `directory`, or starts empty if it is missing.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` if the file cannot be decoded.
    pub fn open(directory: Arc<dyn Directory>, flush_batch: usize) -> IndexResult<Self> {
        let entries = match directory.read_file(MAP_FILE) {
            Ok(bytes) => MapSnapshot::decode(&bytes)?,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(segments = entries.len(), "key map loaded");
        Ok(Self {
            directory,
            current: RwLock::new(Arc::new(MapSnapshot {
                entries,
                version: 0,
            })),
            write_lock: Mutex::new(WriteState::default()),
            flush_batch: flush_batch.max(1),
        })
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<MapSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Resolves the segment owning `key` in the current snapshot.
    pub fn find_segment_id(&self, key: &[u8]) -> Option<SegmentId> {
        self.current.read().find_segment_id(key)
    }

    /// Returns the current version.
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Installs a new snapshot. Caller holds the write lock.
    fn publish(&self, state: &mut WriteState, entries: Vec<(Vec<u8>, SegmentId)>) -> u64 {
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(MapSnapshot { entries, version });
        state.pending += 1;
        version
    }

    /// Adds an entry for a segment that is not routed yet.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the key or the id is already present.
    pub fn insert_segment(&self, max_key: Vec<u8>, id: SegmentId) -> IndexResult<()> {
        let mut state = self.write_lock.lock();
        let snapshot = self.snapshot();
        if snapshot.contains(id) {
            return Err(IndexError::invalid_argument(format!("{id} is already routed")));
        }
        let mut entries = snapshot.entries.clone();
        let pos = entries.partition_point(|(key, _)| key < &max_key);
        if entries.get(pos).is_some_and(|(key, _)| *key == max_key) {
            return Err(IndexError::invalid_argument("max key is already routed"));
        }
        entries.insert(pos, (max_key, id));
        self.publish(&mut state, entries);
        Ok(())
    }

    /// Installs the first segment if the map is still empty at `snapshot`.
    pub fn try_insert_first_segment(
        &self,
        key: &[u8],
        id: SegmentId,
        snapshot: &MapSnapshot,
    ) -> bool {
        let mut state = self.write_lock.lock();
        let current = self.snapshot();
        if current.version != snapshot.version || !current.is_empty() {
            return false;
        }
        self.publish(&mut state, vec![(key.to_vec(), id)]);
        info!(segment_id = %id, "first segment installed");
        true
    }

    /// Extends the last entry so it covers `key`.
    ///
    /// Fails if the map changed since `snapshot` was taken.
    pub fn try_extend_max_key(&self, key: &[u8], snapshot: &MapSnapshot) -> bool {
        let mut state = self.write_lock.lock();
        let current = self.snapshot();
        if current.version != snapshot.version {
            return false;
        }
        match current.max_key() {
            None => false,
            Some(max_key) if key <= max_key => true,
            Some(_) => {
                let mut entries = current.entries.clone();
                if let Some(last) = entries.last_mut() {
                    last.0 = key.to_vec();
                }
                self.publish(&mut state, entries);
                true
            }
        }
    }

    /// Returns true if `key` still routes to `id`.
    ///
    /// An unchanged version is accepted directly. Otherwise the key is
    /// routed again against the live map; ids are never reused, so a
    /// segment that was split away can never validate.
    pub fn is_mapping_valid(&self, key: &[u8], id: SegmentId, version: u64) -> bool {
        let current = self.current.read();
        current.version == version || current.find_segment_id(key) == Some(id)
    }

    /// Replaces the old segment of `plan` by its successors.
    ///
    /// Requires the registry freeze, which orders the registry gate before
    /// the map lock. Returns false, leaving the map untouched, if the plan
    /// does not fit the current map.
    pub fn apply_split_plan(&self, plan: &SplitApplyPlan, _freeze: &FreezeGuard<'_>) -> bool {
        let mut state = self.write_lock.lock();
        let current = self.snapshot();
        let Some(pos) = current.position_of(plan.old_segment_id) else {
            return false;
        };
        let mut entries = current.entries.clone();
        let old_max = entries[pos].0.clone();

        match (plan.status, plan.upper_segment_id) {
            (SplitStatus::Compacted, _) => {
                if current.contains(plan.lower_segment_id) {
                    return false;
                }
                entries[pos].1 = plan.lower_segment_id;
            }
            (SplitStatus::Split, Some(upper)) => {
                if plan.max_key >= old_max
                    || current.contains(plan.lower_segment_id)
                    || current.contains(upper)
                    || (pos > 0 && entries[pos - 1].0 >= plan.max_key)
                {
                    return false;
                }
                entries[pos].1 = upper;
                entries.insert(pos, (plan.max_key.clone(), plan.lower_segment_id));
            }
            (SplitStatus::Split, None) => return false,
        }

        let version = self.publish(&mut state, entries);
        debug!(old = %plan.old_segment_id, version, "split plan applied to key map");
        true
    }

    /// Drops the entry of `id`. Returns false if it is not routed.
    pub fn remove_segment(&self, id: SegmentId, _freeze: &FreezeGuard<'_>) -> bool {
        let mut state = self.write_lock.lock();
        let current = self.snapshot();
        let Some(pos) = current.position_of(id) else {
            return false;
        };
        let mut entries = current.entries.clone();
        entries.remove(pos);
        self.publish(&mut state, entries);
        true
    }

    /// Writes the map if enough lazy changes have accumulated.
    ///
    /// # Errors
    ///
    /// Returns an error if the map file cannot be written.
    pub fn optionally_flush(&self) -> IndexResult<bool> {
        let mut state = self.write_lock.lock();
        if state.pending < self.flush_batch {
            return Ok(false);
        }
        self.write_file(&mut state)?;
        Ok(true)
    }

    /// Writes pending changes to `index.map`.
    ///
    /// # Errors
    ///
    /// Returns an error if the map file cannot be written.
    pub fn flush(&self) -> IndexResult<()> {
        let mut state = self.write_lock.lock();
        if state.pending == 0 && self.directory.file_exists(MAP_FILE) {
            return Ok(());
        }
        self.write_file(&mut state)
    }

    /// Returns the number of changes not yet written.
    pub fn pending_changes(&self) -> usize {
        self.write_lock.lock().pending
    }

    fn write_file(&self, state: &mut WriteState) -> IndexResult<()> {
        let snapshot = self.snapshot();
        self.directory.write_file(MAP_FILE, &snapshot.encode()?)?;
        state.pending = 0;
        debug!(version = snapshot.version, segments = snapshot.len(), "key map flushed");
        Ok(())
    }
}
