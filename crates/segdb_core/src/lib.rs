//! # segdb Core
//!
//! Segment-partitioned index engine for segdb.
//!
//! The keyspace is sharded into segments, each owning a contiguous key range.
//! This crate provides:
//! - The persisted key-to-segment map with versioned, lock-free snapshots
//! - A bounded registry of open segments with single-flight loading
//! - Single-attempt point operations and the busy-retry façade over them
//! - Segment splitting, run asynchronously and applied atomically
//! - Post-write maintenance (flush, compaction, split triggers)
//! - The index lifecycle with directory locking and consistency repair
//! - `LsmSegment`, the reference segment implementation
//!
//! ## Example
//!
//! ```rust
//! use segdb_core::{IndexConfig, Isolation, SegmentIndex, SegmentWindow};
//!
//! let index = SegmentIndex::open_in_memory(IndexConfig::default()).unwrap();
//! index.put(b"b", b"2").unwrap();
//! index.put(b"a", b"1").unwrap();
//!
//! let keys: Vec<Vec<u8>> = index
//!     .get_stream(SegmentWindow::all(), Isolation::FullIsolation)
//!     .unwrap()
//!     .map(|entry| entry.unwrap().0)
//!     .collect();
//! assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod consistency;
mod error;
mod executor;
mod index;
mod index_core;
mod keymap;
mod lifecycle;
mod maintenance;
mod registry;
mod retry;
mod segment;
mod split;
mod stats;
mod stream;
mod types;

pub use config::IndexConfig;
pub use consistency::{ConsistencyChecker, ConsistencyReport};
pub use error::{IndexError, IndexResult};
pub use executor::{
    task_channel, ExecutorLease, ExecutorRegistry, TaskCompleter, TaskHandle, TaskRejected,
    WorkerPool,
};
pub use index::SegmentIndex;
pub use index_core::IndexCore;
pub use keymap::{KeySegmentMap, MapSnapshot, MAP_FILE};
pub use lifecycle::{IndexLifecycle, IndexState, OperationGuard, LOCK_FILE};
pub use maintenance::{
    decide, MaintenanceCoordinator, MaintenanceDecision, MaintenanceKind, MaintenanceThresholds,
};
pub use registry::{FreezeGuard, GateState, SegmentRegistry};
pub use retry::{BusyRetry, RetryTarget};
pub use segment::{
    Isolation, LsmSegment, LsmSegmentFactory, Segment, SegmentFactory, SegmentIterator,
    SegmentRef, SegmentState,
};
pub use split::{
    should_split, AsyncSplitCoordinator, SplitApplyPlan, SplitCoordinator, SplitHandle,
    SplitOutcome, SplitStatus,
};
pub use stats::{IndexStats, MetricsSnapshot};
pub use stream::{IndexStream, SegmentWindow};
pub use types::{key_from_u64, key_to_u64, SegmentId, Status, StatusResult};
