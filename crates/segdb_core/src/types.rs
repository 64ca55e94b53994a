//! Core type definitions for segdb.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a segment.
///
/// Segment ids are allocated monotonically and never reused. Ordering only
/// matters for allocation; the key-to-segment map decides key ranges.
/// Id `0` is reserved and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// The reserved, never-allocated id.
    pub const NULL: Self = Self(0);

    /// The first id handed out by an empty index.
    pub const FIRST: Self = Self(1);

    /// Creates a new segment id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the id allocated after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true for the reserved null id.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment-{:05}", self.0)
    }
}

/// Outcome of a single non-blocking attempt that did not succeed.
///
/// Components below the retry façade never block and never raise for
/// expected contention; they return one of these instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Transient contention with maintenance or a split. Retry.
    Busy,
    /// The segment or registry was closed concurrently.
    Closed,
    /// Internal failure. Never retried.
    Error,
}

impl Status {
    /// Returns true if the façade may retry an attempt that ended with this status.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Status::Busy | Status::Closed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Busy => "BUSY",
            Status::Closed => "CLOSED",
            Status::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Result of a single-attempt operation.
pub type StatusResult<T> = Result<T, Status>;

/// Encodes a `u64` as an order-preserving (big-endian) key.
#[must_use]
pub fn key_from_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes a key produced by [`key_from_u64`].
#[must_use]
pub fn key_to_u64(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_display_and_next() {
        let id = SegmentId::new(7);
        assert_eq!(id.to_string(), "segment-00007");
        assert_eq!(id.next(), SegmentId::new(8));
        assert!(SegmentId::NULL.is_null());
        assert!(!SegmentId::FIRST.is_null());
    }

    #[test]
    fn status_retryability() {
        assert!(Status::Busy.is_retryable());
        assert!(Status::Closed.is_retryable());
        assert!(!Status::Error.is_retryable());
        assert_eq!(Status::Busy.to_string(), "BUSY");
    }

    #[test]
    fn u64_keys_preserve_order() {
        let mut keys: Vec<Vec<u8>> = [300u64, 2, 70_000, 1].iter().map(|v| key_from_u64(*v)).collect();
        keys.sort();
        let decoded: Vec<u64> = keys.iter().filter_map(|k| key_to_u64(k)).collect();
        assert_eq!(decoded, vec![1, 2, 300, 70_000]);
        assert_eq!(key_to_u64(b"short"), None);
    }
}
