//! Split pipeline.
//!
//! A fixed sequence of steps over a [`SplitContext`]. The old segment must
//! already be frozen, so the full-isolation iterator opened by the first
//! step sees every key the segment will ever hold.

use super::plan::{SplitApplyPlan, SplitStatus};
use crate::registry::SegmentRegistry;
use crate::segment::{Isolation, SegmentIterator, SegmentRef};
use crate::types::Status;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a split attempt was abandoned. Never fatal for the index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitAbort {
    /// The segment is not worth splitting.
    #[error("split is not feasible: {0}")]
    Infeasible(&'static str),
    /// A segment operation returned a non-OK status.
    #[error("split step '{step}' ended with status {status}")]
    Status {
        /// Step that failed.
        step: &'static str,
        /// Status returned.
        status: Status,
    },
}

/// Mutable state carried through the pipeline steps.
pub(crate) struct SplitContext<'a> {
    registry: &'a SegmentRegistry,
    segment: &'a SegmentRef,
    min_keys_to_split: usize,
    iterator: Option<SegmentIterator>,
    estimated_keys: usize,
    lower: Option<SegmentRef>,
    upper: Option<SegmentRef>,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    lower_count: usize,
    status: Option<SplitStatus>,
}

type Step = fn(&mut SplitContext<'_>) -> Result<(), SplitAbort>;

const STEPS: [(&str, Step); 5] = [
    ("open_iterator", open_iterator as Step),
    ("check_feasibility", check_feasibility as Step),
    ("fill_lower", fill_lower as Step),
    ("ensure_lower_not_empty", ensure_lower_not_empty as Step),
    ("finish_upper_or_compact", finish_upper_or_compact as Step),
];

/// Runs every step and returns the plan to apply.
///
/// On failure the segments created so far are deleted and fail-fast
/// iterators of the old segment are invalidated. Unfreezing the old
/// segment is left to the caller.
pub(crate) fn run(
    registry: &SegmentRegistry,
    segment: &SegmentRef,
    min_keys_to_split: usize,
) -> Result<SplitApplyPlan, SplitAbort> {
    let mut ctx = SplitContext {
        registry,
        segment,
        min_keys_to_split,
        iterator: None,
        estimated_keys: 0,
        lower: None,
        upper: None,
        min_key: None,
        max_key: None,
        lower_count: 0,
        status: None,
    };

    for (name, step) in STEPS {
        if let Err(abort) = step(&mut ctx) {
            warn!(segment_id = %segment.id(), step = name, reason = %abort, "split aborted");
            ctx.abort();
            return Err(abort);
        }
    }
    ctx.into_plan()
}

impl SplitContext<'_> {
    fn abort(&mut self) {
        self.iterator = None;
        self.segment.invalidate_iterators();
        for created in [self.lower.take(), self.upper.take()].into_iter().flatten() {
            let id = created.id();
            drop(created);
            if let Err(status) = self.registry.delete_segment(id) {
                warn!(segment_id = %id, %status, "could not delete abandoned split segment");
            }
        }
    }

    fn into_plan(mut self) -> Result<SplitApplyPlan, SplitAbort> {
        let lower_id = self.lower.as_ref().map(|lower| lower.id());
        match (lower_id, self.status, self.min_key.take(), self.max_key.take()) {
            (Some(lower_segment_id), Some(status), Some(min_key), Some(max_key)) => {
                Ok(SplitApplyPlan {
                    old_segment_id: self.segment.id(),
                    lower_segment_id,
                    upper_segment_id: self.upper.as_ref().map(|upper| upper.id()),
                    min_key,
                    max_key,
                    status,
                })
            }
            _ => {
                self.abort();
                Err(SplitAbort::Status {
                    step: "into_plan",
                    status: Status::Error,
                })
            }
        }
    }

    fn create_segment(&self, step: &'static str) -> Result<SegmentRef, SplitAbort> {
        self.registry
            .create_segment()
            .map_err(|status| SplitAbort::Status { step, status })
    }
}

fn open_iterator(ctx: &mut SplitContext<'_>) -> Result<(), SplitAbort> {
    let iterator = ctx
        .segment
        .open_iterator(Isolation::FullIsolation)
        .map_err(|status| SplitAbort::Status {
            step: "open_iterator",
            status,
        })?;
    ctx.estimated_keys = ctx.segment.estimated_number_of_keys();
    ctx.iterator = Some(iterator);
    Ok(())
}

fn check_feasibility(ctx: &mut SplitContext<'_>) -> Result<(), SplitAbort> {
    if ctx.estimated_keys < ctx.min_keys_to_split {
        return Err(SplitAbort::Infeasible("too few keys"));
    }
    Ok(())
}

fn fill_lower(ctx: &mut SplitContext<'_>) -> Result<(), SplitAbort> {
    let target = (ctx.estimated_keys / 2).max(1);
    let lower = ctx.create_segment("fill_lower")?;
    ctx.lower = Some(lower.clone());

    let Some(iterator) = ctx.iterator.as_mut() else {
        return Err(SplitAbort::Infeasible("iterator not open"));
    };
    while ctx.lower_count < target {
        let Some(entry) = iterator.next() else { break };
        let (key, value) = entry.map_err(|status| SplitAbort::Status {
            step: "fill_lower",
            status,
        })?;
        lower.put(&key, &value).map_err(|status| SplitAbort::Status {
            step: "fill_lower",
            status,
        })?;
        if ctx.min_key.is_none() {
            ctx.min_key = Some(key.clone());
        }
        ctx.max_key = Some(key);
        ctx.lower_count += 1;
    }
    Ok(())
}

fn ensure_lower_not_empty(ctx: &mut SplitContext<'_>) -> Result<(), SplitAbort> {
    if ctx.lower_count == 0 {
        return Err(SplitAbort::Infeasible("no live keys for the lower segment"));
    }
    Ok(())
}

fn finish_upper_or_compact(ctx: &mut SplitContext<'_>) -> Result<(), SplitAbort> {
    let step = "finish_upper_or_compact";
    let Some(mut iterator) = ctx.iterator.take() else {
        return Err(SplitAbort::Infeasible("iterator not open"));
    };

    match iterator.next() {
        None => ctx.status = Some(SplitStatus::Compacted),
        Some(first) => {
            let upper = ctx.create_segment(step)?;
            ctx.upper = Some(upper.clone());
            for entry in std::iter::once(first).chain(iterator) {
                let (key, value) = entry.map_err(|status| SplitAbort::Status { step, status })?;
                upper
                    .put(&key, &value)
                    .map_err(|status| SplitAbort::Status { step, status })?;
            }
            ctx.status = Some(SplitStatus::Split);
        }
    }

    for segment in [ctx.lower.as_ref(), ctx.upper.as_ref()].into_iter().flatten() {
        segment
            .compact()
            .map_err(|status| SplitAbort::Status { step, status })?;
    }
    debug!(
        segment_id = %ctx.segment.id(),
        lower_keys = ctx.lower_count,
        status = ?ctx.status,
        "split pipeline finished"
    );
    Ok(())
}
