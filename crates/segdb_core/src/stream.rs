//! Ordered range streaming across segments.
//!
//! A stream is planned as a list of key ranges taken from the map snapshot
//! at open time, one per selected segment. Each range is resolved against
//! the live map when it is reached, so a split that replaces a segment
//! mid-stream only changes which segments serve the range, never which keys
//! are returned. A fail-fast segment iterator that gets invalidated resumes
//! after the last key it produced.

use crate::error::{IndexError, IndexResult};
use crate::keymap::{KeySegmentMap, MapSnapshot};
use crate::registry::{GateState, SegmentRegistry};
use crate::retry::{BusyRetry, RetryTarget};
use crate::segment::{Isolation, SegmentIterator};
use crate::types::{SegmentId, Status};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Selects segments by position in key order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentWindow {
    offset: usize,
    limit: Option<usize>,
}

impl SegmentWindow {
    /// Every segment.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }

    /// At most `limit` segments starting at position `offset`.
    #[must_use]
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// Every segment from position `offset` on.
    #[must_use]
    pub const fn from_offset(offset: usize) -> Self {
        Self {
            offset,
            limit: None,
        }
    }

    /// Returns the first position selected.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the maximum number of segments selected.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn ranges(&self, snapshot: &MapSnapshot) -> VecDeque<KeyRange> {
        let entries = snapshot.entries();
        let end = match self.limit {
            Some(limit) => self.offset.saturating_add(limit).min(entries.len()),
            None => entries.len(),
        };
        (self.offset.min(end)..end)
            .map(|pos| KeyRange {
                after: pos.checked_sub(1).map(|prev| entries[prev].0.clone()),
                // the last entry also owns keys added by later extensions
                upto: (pos + 1 < entries.len()).then(|| entries[pos].0.clone()),
            })
            .collect()
    }
}

/// Keys in `(after, upto]`; a missing bound is open.
#[derive(Debug, Clone)]
struct KeyRange {
    after: Option<Vec<u8>>,
    upto: Option<Vec<u8>>,
}

impl KeyRange {
    fn contains(&self, key: &[u8]) -> bool {
        self.after.as_deref().map_or(true, |after| key > after)
            && self.upto.as_deref().map_or(true, |upto| key <= upto)
    }

    fn is_past(&self, key: &[u8]) -> bool {
        self.upto.as_deref().is_some_and(|upto| key > upto)
    }

    /// Segments of `snapshot` whose range overlaps this one, in key order.
    fn resolve(&self, snapshot: &MapSnapshot) -> VecDeque<SegmentId> {
        let mut prev: Option<&[u8]> = None;
        let mut ids = VecDeque::new();
        for (max_key, id) in snapshot.entries() {
            let above_start = self.after.as_deref().map_or(true, |after| max_key.as_slice() > after);
            let below_end = match (prev, self.upto.as_deref()) {
                (Some(prev), Some(upto)) => prev < upto,
                _ => true,
            };
            if above_start && below_end {
                ids.push_back(*id);
            }
            prev = Some(max_key);
        }
        ids
    }
}

struct Cursor {
    range: KeyRange,
    segments: VecDeque<SegmentId>,
    open: Option<(SegmentId, SegmentIterator)>,
}

/// Lazy ordered stream of live entries.
pub struct IndexStream {
    map: Arc<KeySegmentMap>,
    registry: Arc<SegmentRegistry>,
    retry: Arc<BusyRetry>,
    isolation: Isolation,
    ranges: VecDeque<KeyRange>,
    cursor: Option<Cursor>,
    done: bool,
}

impl IndexStream {
    /// Plans a stream over the segments `window` selects right now.
    pub fn new(
        map: Arc<KeySegmentMap>,
        registry: Arc<SegmentRegistry>,
        retry: Arc<BusyRetry>,
        window: SegmentWindow,
        isolation: Isolation,
    ) -> Self {
        let ranges = window.ranges(&map.snapshot());
        Self {
            map,
            registry,
            retry,
            isolation,
            ranges,
            cursor: None,
            done: false,
        }
    }

    /// Opens an iterator on `id`. `Ok(None)` if the segment was split away.
    fn open(&self, id: SegmentId) -> IndexResult<Option<SegmentIterator>> {
        if self.registry.gate_state() == GateState::Closed {
            return Err(IndexError::IndexClosed);
        }
        self.retry
            .run("get_stream", RetryTarget::Segment(id), || {
                match self.registry.get_segment(id) {
                    Ok(segment) => match segment.open_iterator(self.isolation) {
                        Ok(iterator) => Ok(Some(iterator)),
                        // evicted while opening
                        Err(Status::Closed) => Err(Status::Busy),
                        Err(status) => Err(status),
                    },
                    Err(Status::Error) if !self.map.snapshot().contains(id) => Ok(None),
                    Err(status) => Err(status),
                }
            })
    }

    fn fail(&mut self, err: IndexError) -> Option<IndexResult<(Vec<u8>, Vec<u8>)>> {
        self.done = true;
        self.cursor = None;
        Some(Err(err))
    }
}

impl Iterator for IndexStream {
    type Item = IndexResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(mut cursor) = self.cursor.take() else {
                let Some(range) = self.ranges.pop_front() else {
                    self.done = true;
                    return None;
                };
                let segments = range.resolve(&self.map.snapshot());
                self.cursor = Some(Cursor {
                    range,
                    segments,
                    open: None,
                });
                continue;
            };

            if let Some((id, mut iterator)) = cursor.open.take() {
                match iterator.next() {
                    Some(Ok((key, value))) => {
                        if cursor.range.is_past(&key) {
                            // rest of this segment belongs to the next range
                            self.cursor = Some(cursor);
                            continue;
                        }
                        let in_range = cursor.range.contains(&key);
                        if in_range {
                            cursor.range.after = Some(key.clone());
                        }
                        cursor.open = Some((id, iterator));
                        self.cursor = Some(cursor);
                        if in_range {
                            return Some(Ok((key, value)));
                        }
                    }
                    Some(Err(_)) => {
                        debug!(segment_id = %id, "stream iterator invalidated, resuming");
                        cursor.segments = cursor.range.resolve(&self.map.snapshot());
                        self.cursor = Some(cursor);
                    }
                    None => self.cursor = Some(cursor),
                }
                continue;
            }

            let Some(id) = cursor.segments.pop_front() else {
                // range exhausted
                continue;
            };
            match self.open(id) {
                Ok(Some(iterator)) => cursor.open = Some((id, iterator)),
                Ok(None) => cursor.segments = cursor.range.resolve(&self.map.snapshot()),
                Err(err) => return self.fail(err),
            }
            self.cursor = Some(cursor);
        }
    }
}

impl fmt::Debug for IndexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexStream")
            .field("isolation", &self.isolation)
            .field("remaining_ranges", &self.ranges.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
