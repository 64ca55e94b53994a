//! The public segment index.
//!
//! [`SegmentIndex`] is the façade the embedding application talks to. Every
//! call is admitted by the lifecycle, routed through the single-attempt
//! [`IndexCore`] and repeated by the [`BusyRetry`] policy until it succeeds,
//! fails or the busy timeout expires. Fatal errors move the whole index into
//! the ERROR state.

use crate::config::IndexConfig;
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::error::{IndexError, IndexResult};
use crate::executor::{task_channel, ExecutorLease, ExecutorRegistry, TaskHandle};
use crate::index_core::IndexCore;
use crate::keymap::KeySegmentMap;
use crate::lifecycle::{IndexLifecycle, IndexState, OperationGuard};
use crate::maintenance::{MaintenanceCoordinator, MaintenanceThresholds};
use crate::registry::SegmentRegistry;
use crate::retry::{BusyRetry, RetryTarget};
use crate::segment::{Isolation, LsmSegmentFactory, SegmentFactory, SegmentRef};
use crate::split::{AsyncSplitCoordinator, SplitCoordinator};
use crate::stats::{IndexStats, MetricsSnapshot};
use crate::stream::{IndexStream, SegmentWindow};
use crate::types::{SegmentId, Status, StatusResult};
use segdb_storage::{Directory, FsDirectory, MemDirectory};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, info_span, warn, Span};

/// Pool names, shared by every index of the process.
const IO_POOL: &str = "segdb-io";
const MAINTENANCE_POOL: &str = "segdb-maintenance";
const SPLIT_POOL: &str = "segdb-split";
const REGISTRY_POOL: &str = "segdb-registry";

/// An open segment index.
///
/// The index is `Send + Sync`; share it behind an `Arc` to use it from
/// several threads. Dropping it closes it.
///
/// # Example
///
/// ```rust
/// use segdb_core::{IndexConfig, SegmentIndex};
///
/// let index = SegmentIndex::open_in_memory(IndexConfig::default()).unwrap();
/// index.put(b"apple", b"red").unwrap();
/// assert_eq!(index.get(b"apple").unwrap(), Some(b"red".to_vec()));
/// index.close().unwrap();
/// ```
pub struct SegmentIndex {
    shared: Arc<IndexShared>,
}

/// Everything asynchronous operations need, shared with the IO pool.
struct IndexShared {
    config: IndexConfig,
    lifecycle: IndexLifecycle,
    core: IndexCore,
    retry: Arc<BusyRetry>,
    splits: Arc<AsyncSplitCoordinator>,
    consistency: ConsistencyChecker,
    io: ExecutorLease,
    stats: Arc<IndexStats>,
    torn_down: AtomicBool,
    span: Span,
}

/// Components built while the index is OPENING.
struct Components {
    core: IndexCore,
    retry: Arc<BusyRetry>,
    splits: Arc<AsyncSplitCoordinator>,
    consistency: ConsistencyChecker,
    io: ExecutorLease,
    stats: Arc<IndexStats>,
}

impl Components {
    fn assemble(
        directory: Arc<dyn Directory>,
        config: &IndexConfig,
        span: &Span,
    ) -> IndexResult<Self> {
        let map = Arc::new(KeySegmentMap::open(
            Arc::clone(&directory),
            config.map_flush_batch,
        )?);
        let factory = Arc::new(LsmSegmentFactory::new(directory));
        let on_disk = factory.list_segment_ids()?;
        let first_free = map
            .snapshot()
            .max_segment_id()
            .into_iter()
            .chain(on_disk.last().copied())
            .max()
            .map_or(SegmentId::FIRST, SegmentId::next);

        let executors = ExecutorRegistry::global();
        let capacity = config.executor_queue_capacity;
        let io = executors.lease(IO_POOL, config.number_of_io_threads, capacity)?;
        let maintenance_pool =
            executors.lease(MAINTENANCE_POOL, config.number_of_maintenance_threads, capacity)?;
        let split_pool = executors.lease(SPLIT_POOL, config.number_of_split_threads, capacity)?;
        let registry_pool = executors.lease(
            REGISTRY_POOL,
            config.number_of_registry_lifecycle_threads,
            capacity,
        )?;

        let stats = Arc::new(IndexStats::new());
        let registry = Arc::new(SegmentRegistry::new(
            factory,
            config,
            registry_pool,
            Arc::clone(&stats),
            span.clone(),
            first_free,
        ));
        let split_coordinator = Arc::new(SplitCoordinator::new(
            Arc::clone(&map),
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.min_keys_to_split,
            config.busy_backoff,
            config.busy_timeout,
        ));
        let splits = Arc::new(AsyncSplitCoordinator::new(
            split_coordinator,
            split_pool,
            span.clone(),
        ));
        let maintenance = Arc::new(MaintenanceCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&splits),
            maintenance_pool,
            MaintenanceThresholds::from(config),
            Arc::clone(&stats),
            span.clone(),
        ));
        let retry = Arc::new(BusyRetry::new(
            config.busy_backoff,
            config.busy_timeout,
            Arc::clone(&map),
            Arc::clone(&splits),
            Arc::clone(&stats),
        ));
        let consistency = ConsistencyChecker::new(
            Arc::clone(&map),
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.busy_backoff,
            config.busy_timeout,
        );

        info!(
            segments = map.snapshot().len(),
            first_free = %first_free,
            "index loaded"
        );
        Ok(Self {
            core: IndexCore::new(map, registry, maintenance, Arc::clone(&stats)),
            retry,
            splits,
            consistency,
            io,
            stats,
        })
    }
}

impl SegmentIndex {
    /// Opens the index stored in `directory`, creating it if it is empty.
    ///
    /// The directory is locked for the lifetime of the index. A lock file
    /// left behind by a crashed owner is taken over, and a consistency pass
    /// runs before the index starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the configuration is invalid (`InvalidConfig`)
    /// - another owner holds the directory (`DirectoryLocked`)
    /// - the key map or a segment is corrupted (`Corruption`)
    /// - I/O errors occur
    pub fn open(directory: Arc<dyn Directory>, config: IndexConfig) -> IndexResult<Self> {
        config.validate()?;
        let span = info_span!("segdb", index = %config.index_name);
        let _entered = span.clone().entered();

        let lifecycle = IndexLifecycle::acquire(directory.as_ref())?;
        let components = match Components::assemble(directory, &config, &span) {
            Ok(components) => components,
            Err(err) => {
                lifecycle.fail(err.to_string());
                return Err(err);
            }
        };

        if lifecycle.stale_lock_recovered() {
            info!("running consistency check after stale lock");
            if let Err(err) = components.consistency.check_and_repair() {
                lifecycle.fail(err.to_string());
                return Err(err);
            }
        }

        let shared = IndexShared {
            config,
            lifecycle,
            core: components.core,
            retry: components.retry,
            splits: components.splits,
            consistency: components.consistency,
            io: components.io,
            stats: components.stats,
            torn_down: AtomicBool::new(false),
            span: span.clone(),
        };
        shared.lifecycle.mark_ready();
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Opens the index stored in the directory at `path`.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), plus I/O errors creating the directory.
    pub fn open_path(path: &Path, config: IndexConfig) -> IndexResult<Self> {
        let directory = FsDirectory::open(path)?;
        Self::open(Arc::new(directory), config)
    }

    /// Opens a fresh index that lives in memory only.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is invalid.
    pub fn open_in_memory(config: IndexConfig) -> IndexResult<Self> {
        Self::open(Arc::new(MemDirectory::new()), config)
    }

    // ========================================================================
    // Point operations
    // ========================================================================

    /// Reads the value stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty key, a lifecycle error if the
    /// index is not READY, or the error the operation ended with.
    pub fn get(&self, key: &[u8]) -> IndexResult<Option<Vec<u8>>> {
        check_key(key)?;
        let _guard = self.shared.admit()?;
        self.shared.get(key)
    }

    /// Writes `value` for `key`.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn put(&self, key: &[u8], value: &[u8]) -> IndexResult<()> {
        check_key(key)?;
        let _guard = self.shared.admit()?;
        self.shared.put(key, value)
    }

    /// Deletes `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn delete(&self, key: &[u8]) -> IndexResult<()> {
        check_key(key)?;
        let _guard = self.shared.admit()?;
        self.shared.delete(key)
    }

    /// Reads `key` on the IO pool.
    ///
    /// The operation is admitted before this returns, so [`close`](Self::close)
    /// waits for it.
    pub fn get_async(&self, key: Vec<u8>) -> TaskHandle<Option<Vec<u8>>> {
        if let Err(err) = check_key(&key) {
            return TaskHandle::ready(Err(err));
        }
        self.submit("get", move |shared| shared.get(&key))
    }

    /// Writes `value` for `key` on the IO pool.
    pub fn put_async(&self, key: Vec<u8>, value: Vec<u8>) -> TaskHandle<()> {
        if let Err(err) = check_key(&key) {
            return TaskHandle::ready(Err(err));
        }
        self.submit("put", move |shared| shared.put(&key, &value))
    }

    /// Deletes `key` on the IO pool.
    pub fn delete_async(&self, key: Vec<u8>) -> TaskHandle<()> {
        if let Err(err) = check_key(&key) {
            return TaskHandle::ready(Err(err));
        }
        self.submit("delete", move |shared| shared.delete(&key))
    }

    fn submit<T, F>(&self, operation: &'static str, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&IndexShared) -> IndexResult<T> + Send + 'static,
    {
        let guard = match self.shared.admit() {
            Ok(guard) => guard,
            Err(err) => return TaskHandle::ready(Err(err)),
        };

        let (completer, handle) = task_channel();
        let shared = Arc::clone(&self.shared);
        let submitted = self.shared.io.submit(move || {
            let _entered = shared.span.enter();
            completer.complete(work(&shared));
            drop(guard);
        });
        match submitted {
            Ok(()) => handle,
            Err(rejected) => {
                warn!(operation, error = %rejected, "async operation rejected");
                TaskHandle::ready(Err(IndexError::from_status(
                    operation,
                    None,
                    Status::Busy,
                    false,
                )))
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Schedules a flush of every segment and persists the key map.
    ///
    /// # Errors
    ///
    /// Returns an error if a flush cannot be scheduled or the map cannot be
    /// written.
    pub fn flush(&self) -> IndexResult<()> {
        let _guard = self.shared.admit()?;
        self.shared.schedule_each("flush", |maintenance, id| {
            maintenance.request_flush(id)
        })?;
        self.shared.observe(self.shared.core.map().flush())
    }

    /// Flushes every segment, waits for splits and maintenance to settle and
    /// persists the key map.
    ///
    /// # Errors
    ///
    /// `OperationTimedOut` if splits or maintenance do not finish within the
    /// busy timeout, or the error a segment flush ended with.
    pub fn flush_and_wait(&self) -> IndexResult<()> {
        let _guard = self.shared.admit()?;
        self.shared.run_and_wait("flush", |core, id| core.flush_segment(id))
    }

    /// Schedules a compaction of every segment.
    ///
    /// # Errors
    ///
    /// Returns an error if a compaction cannot be scheduled.
    pub fn compact(&self) -> IndexResult<()> {
        let _guard = self.shared.admit()?;
        self.shared.schedule_each("compact", |maintenance, id| {
            maintenance.request_compact(id)
        })
    }

    /// Compacts every segment and waits for splits and maintenance to settle.
    ///
    /// # Errors
    ///
    /// Same as [`flush_and_wait`](Self::flush_and_wait).
    pub fn compact_and_wait(&self) -> IndexResult<()> {
        let _guard = self.shared.admit()?;
        self.shared
            .run_and_wait("compact", |core, id| core.compact_segment(id))
    }

    /// Reconciles the key map with the segments and applies safe repairs.
    ///
    /// # Errors
    ///
    /// `Corruption` for findings that cannot be repaired; the index then
    /// enters the ERROR state.
    pub fn check_and_repair_consistency(&self) -> IndexResult<ConsistencyReport> {
        let _guard = self.shared.admit()?;
        self.shared.await_splits("check_consistency")?;
        self.shared
            .observe(self.shared.consistency.check_and_repair())
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Streams the live entries of the segments `window` selects, in key
    /// order.
    ///
    /// With [`Isolation::FullIsolation`] in-flight splits are drained first
    /// so the stream starts on a single generation of segments.
    ///
    /// # Errors
    ///
    /// A lifecycle error if the index is not READY, or `OperationTimedOut`
    /// if splits do not drain in time.
    pub fn get_stream(&self, window: SegmentWindow, isolation: Isolation) -> IndexResult<IndexStream> {
        let _guard = self.shared.admit()?;
        if isolation == Isolation::FullIsolation {
            self.shared.await_splits("get_stream")?;
        }
        Ok(IndexStream::new(
            Arc::clone(self.shared.core.map()),
            Arc::clone(self.shared.core.registry()),
            Arc::clone(&self.shared.retry),
            window,
            isolation,
        ))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns the configuration the index was opened with.
    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.shared.config
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> IndexState {
        self.shared.lifecycle.state()
    }

    /// Returns true if a stale directory lock was taken over while opening.
    #[must_use]
    pub fn stale_lock_recovered(&self) -> bool {
        self.shared.lifecycle.stale_lock_recovered()
    }

    /// Returns the live statistics.
    #[must_use]
    pub fn stats(&self) -> &IndexStats {
        &self.shared.stats
    }

    /// Captures the current metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let core = &self.shared.core;
        let snapshot = core.map().snapshot();
        MetricsSnapshot::capture(
            &self.shared.stats,
            self.state(),
            snapshot.len(),
            core.registry().cached_segments(),
            snapshot.version(),
        )
    }

    /// Returns the ids of the routed segments in key order.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.shared.core.map().snapshot().segment_ids()
    }

    /// Closes the index.
    ///
    /// Stops admitting operations, waits for admitted ones (async included),
    /// drains splits and maintenance, persists the key map, closes every
    /// cached segment and releases the directory lock. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `IndexFailed` if the index was in the ERROR state; the directory lock
    /// is kept in that case. Otherwise the error persisting the map.
    pub fn close(&self) -> IndexResult<()> {
        self.shared.close()
    }
}

impl IndexShared {
    fn admit(&self) -> IndexResult<OperationGuard> {
        self.lifecycle.try_perform_operation()
    }

    fn get(&self, key: &[u8]) -> IndexResult<Option<Vec<u8>>> {
        let result = self
            .retry
            .run("get", RetryTarget::Key(key), || self.core.get(key));
        self.observe(result)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> IndexResult<()> {
        let result = self
            .retry
            .run("put", RetryTarget::Key(key), || self.core.put(key, value));
        self.observe(result)
    }

    fn delete(&self, key: &[u8]) -> IndexResult<()> {
        let result = self
            .retry
            .run("delete", RetryTarget::Key(key), || self.core.delete(key));
        self.observe(result)
    }

    /// Moves the index to ERROR if `result` is a fatal error.
    fn observe<T>(&self, result: IndexResult<T>) -> IndexResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.lifecycle.fail(err.to_string());
            }
        }
        result
    }

    fn await_splits(&self, operation: &'static str) -> IndexResult<()> {
        if self.splits.await_all_completions(self.config.busy_timeout) {
            Ok(())
        } else {
            Err(IndexError::from_status(operation, None, Status::Busy, true))
        }
    }

    /// Runs `request` for every routed segment.
    ///
    /// A segment that a split replaced meanwhile is skipped; its successors
    /// are picked up by the next pass.
    fn schedule_each(
        &self,
        operation: &'static str,
        request: impl Fn(&MaintenanceCoordinator, SegmentId) -> StatusResult<bool>,
    ) -> IndexResult<()> {
        let map = self.core.map();
        for id in map.snapshot().segment_ids() {
            let result = self.retry.run(operation, RetryTarget::Segment(id), || {
                match request(self.core.maintenance(), id) {
                    Err(Status::Error) if !map.snapshot().contains(id) => Ok(false),
                    other => other,
                }
            });
            self.observe(result)?;
        }
        Ok(())
    }

    /// Runs `action` on every routed segment and waits for the index to
    /// settle.
    fn run_and_wait(
        &self,
        operation: &'static str,
        action: impl Fn(&IndexCore, SegmentId) -> StatusResult<SegmentRef>,
    ) -> IndexResult<()> {
        self.await_splits(operation)?;
        let map = self.core.map();
        for id in map.snapshot().segment_ids() {
            let result = self.retry.run(operation, RetryTarget::Segment(id), || {
                match action(&self.core, id) {
                    Ok(segment) => Ok(Some(segment)),
                    Err(Status::Error) if !map.snapshot().contains(id) => Ok(None),
                    Err(status) => Err(status),
                }
            });
            if let Some(segment) = self.observe(result)? {
                let ready = self.retry.await_segment_ready(operation, &segment);
                self.observe(ready)?;
            }
        }

        self.await_splits(operation)?;
        if !self.core.maintenance().await_idle(self.config.busy_timeout) {
            return Err(IndexError::from_status(operation, None, Status::Busy, true));
        }
        self.observe(map.flush())
    }

    fn close(&self) -> IndexResult<()> {
        let _entered = self.span.enter();
        let previous = self.lifecycle.begin_close();
        if previous == IndexState::Closed || self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let timeout = self.config.busy_timeout;
        if !self.lifecycle.await_operations(timeout) {
            warn!(in_flight = self.lifecycle.in_flight(), "closing with operations still running");
        }
        self.splits.close();
        if !self.splits.await_all_completions(timeout) {
            warn!(in_flight = self.splits.in_flight_count(), "closing with splits still running");
        }
        let maintenance = self.core.maintenance();
        maintenance.close();
        if !maintenance.await_idle(timeout) {
            warn!(pending = maintenance.pending_tasks(), "closing with maintenance still pending");
        }

        if previous == IndexState::Error {
            // leave the files exactly as the failure left them
            self.core.registry().fail();
            let cause = self.lifecycle.fatal_cause().unwrap_or_default();
            warn!(cause = %cause, "index closed in ERROR state, directory lock retained");
            return Err(IndexError::IndexFailed { cause });
        }

        self.core.registry().close();
        self.core.map().flush()?;
        self.lifecycle.release_lock()?;
        info!("index closed");
        Ok(())
    }
}

fn check_key(key: &[u8]) -> IndexResult<()> {
    if key.is_empty() {
        Err(IndexError::invalid_argument("key must not be empty"))
    } else {
        Ok(())
    }
}

impl Drop for SegmentIndex {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentIndex")
            .field("name", &self.shared.config.index_name)
            .field("state", &self.state())
            .field("segments", &self.shared.core.map().snapshot().len())
            .finish_non_exhaustive()
    }
}
