//! Asynchronous split scheduling with per-segment de-duplication.

use super::coordinator::SplitCoordinator;
use super::plan::SplitStatus;
use crate::executor::ExecutorLease;
use crate::segment::SegmentRef;
use crate::types::SegmentId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn, Span};

/// How a scheduled split attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOutcome {
    /// The plan was applied.
    Applied(SplitStatus),
    /// Nothing changed: below threshold, replaced instance or aborted pipeline.
    Skipped,
    /// The attempt never ran or panicked.
    Failed,
}

#[derive(Default)]
struct HandleState {
    started: bool,
    outcome: Option<SplitOutcome>,
}

struct HandleInner {
    state: Mutex<HandleState>,
    changed: Condvar,
}

/// Awaitable view of one split attempt. Clones observe the same attempt.
#[derive(Clone)]
pub struct SplitHandle {
    inner: Arc<HandleInner>,
}

impl SplitHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(HandleState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    fn finished(outcome: SplitOutcome) -> Self {
        let handle = Self::new();
        handle.complete(outcome);
        handle
    }

    fn mark_started(&self) {
        self.inner.state.lock().started = true;
        self.inner.changed.notify_all();
    }

    fn complete(&self, outcome: SplitOutcome) {
        let mut state = self.inner.state.lock();
        state.started = true;
        state.outcome.get_or_insert(outcome);
        self.inner.changed.notify_all();
    }

    /// Waits until a worker picked the attempt up. Returns false on timeout.
    pub fn await_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.started {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.started;
            }
        }
        true
    }

    /// Waits for the outcome. `None` if `timeout` expired first.
    pub fn await_completion(&self, timeout: Duration) -> Option<SplitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.outcome.is_none() {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome
    }

    /// Returns true once the attempt finished.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Returns true if both handles observe the same attempt.
    pub fn same_attempt(&self, other: &SplitHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SplitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SplitHandle")
            .field("started", &state.started)
            .field("outcome", &state.outcome)
            .finish()
    }
}

type InFlight = Arc<Mutex<HashMap<SegmentId, SplitHandle>>>;

/// Runs split attempts on the split pool, one per segment id at a time.
pub struct AsyncSplitCoordinator {
    coordinator: Arc<SplitCoordinator>,
    pool: ExecutorLease,
    in_flight: InFlight,
    closed: AtomicBool,
    span: Span,
}

impl AsyncSplitCoordinator {
    /// Creates a coordinator scheduling on `pool`.
    pub fn new(coordinator: Arc<SplitCoordinator>, pool: ExecutorLease, span: Span) -> Self {
        Self {
            coordinator,
            pool,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            span,
        }
    }

    /// Schedules a split of `segment`, or joins the attempt already in flight.
    ///
    /// Never blocks: a refused submission completes the handle with
    /// [`SplitOutcome::Failed`].
    pub fn trigger(&self, segment: SegmentRef, threshold: usize) -> SplitHandle {
        if self.closed.load(Ordering::Acquire) {
            return SplitHandle::finished(SplitOutcome::Failed);
        }
        let id = segment.id();
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(&id) {
            return existing.clone();
        }

        let handle = SplitHandle::new();
        in_flight.insert(id, handle.clone());

        let task = SplitTask {
            coordinator: Arc::clone(&self.coordinator),
            in_flight: Arc::clone(&self.in_flight),
            handle: handle.clone(),
            segment,
            threshold,
            span: self.span.clone(),
        };
        if let Err(err) = self.pool.submit(move || task.run()) {
            warn!(segment_id = %id, error = %err, "split not scheduled");
            in_flight.remove(&id);
            handle.complete(SplitOutcome::Failed);
        } else {
            debug!(segment_id = %id, "split scheduled");
        }
        handle
    }

    /// Returns the attempt in flight for `id`, if any.
    pub fn in_flight_for(&self, id: SegmentId) -> Option<SplitHandle> {
        self.in_flight.lock().get(&id).cloned()
    }

    /// Returns the number of attempts in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Waits until no split is in flight. Returns false on timeout.
    ///
    /// Attempts triggered while waiting are waited for as well.
    pub fn await_all_completions(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: Vec<SplitHandle> = self.in_flight.lock().values().cloned().collect();
            if pending.is_empty() {
                return true;
            }
            for handle in pending {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if handle.await_completion(remaining).is_none() {
                    return false;
                }
            }
        }
    }

    /// Stops accepting new triggers. Running attempts finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for AsyncSplitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSplitCoordinator")
            .field("in_flight", &self.in_flight_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct SplitTask {
    coordinator: Arc<SplitCoordinator>,
    in_flight: InFlight,
    handle: SplitHandle,
    segment: SegmentRef,
    threshold: usize,
    span: Span,
}

impl SplitTask {
    fn run(self) {
        let _entered = self.span.enter();
        let id = self.segment.id();
        self.handle.mark_started();

        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.coordinator.optionally_split(&self.segment, self.threshold)
        })) {
            Ok(Some(status)) => SplitOutcome::Applied(status),
            Ok(None) => SplitOutcome::Skipped,
            Err(_) => {
                error!(segment_id = %id, "split attempt panicked");
                SplitOutcome::Failed
            }
        };

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&id)
                .is_some_and(|current| current.same_attempt(&self.handle))
            {
                in_flight.remove(&id);
            }
        }
        self.handle.complete(outcome);
    }
}
