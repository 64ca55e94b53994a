//! Segment splitting.
//!
//! A segment whose live key count reaches the configured threshold is
//! frozen, copied into one or two fresh segments by the [`pipeline`], and
//! the resulting [`SplitApplyPlan`] is swapped into the key map and the
//! registry under the registry freeze. [`AsyncSplitCoordinator`] runs
//! splits on the split pool and de-duplicates triggers per segment.

mod async_split;
mod coordinator;
pub(crate) mod pipeline;
mod plan;

pub use async_split::{AsyncSplitCoordinator, SplitHandle, SplitOutcome};
pub use coordinator::{should_split, SplitCoordinator};
pub use plan::{SplitApplyPlan, SplitStatus};
