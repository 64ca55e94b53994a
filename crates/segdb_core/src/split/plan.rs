//! Result of a split pipeline.

use crate::types::SegmentId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a split attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitStatus {
    /// Keys were divided between a lower and an upper segment.
    Split,
    /// No keys were left for an upper half; the lower segment replaces the
    /// old one with the same key range.
    Compacted,
}

impl fmt::Display for SplitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split => f.write_str("SPLIT"),
            Self::Compacted => f.write_str("COMPACTED"),
        }
    }
}

/// Replacement of one segment, ready to be applied to the key map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitApplyPlan {
    /// Segment being replaced.
    pub old_segment_id: SegmentId,
    /// Segment holding the lower keys (or every key when compacted).
    pub lower_segment_id: SegmentId,
    /// Segment holding the remaining keys. `None` when compacted.
    pub upper_segment_id: Option<SegmentId>,
    /// Smallest key written to the lower segment.
    pub min_key: Vec<u8>,
    /// Largest key written to the lower segment; the new routing boundary.
    pub max_key: Vec<u8>,
    /// Outcome.
    pub status: SplitStatus,
}

impl SplitApplyPlan {
    /// Returns the ids of the segments this plan introduces.
    pub fn new_segment_ids(&self) -> Vec<SegmentId> {
        std::iter::once(self.lower_segment_id)
            .chain(self.upper_segment_id)
            .collect()
    }
}
