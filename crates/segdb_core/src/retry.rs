//! Bounded busy-retry around single-attempt operations.

use crate::error::{IndexError, IndexResult};
use crate::keymap::KeySegmentMap;
use crate::segment::{SegmentRef, SegmentState};
use crate::split::AsyncSplitCoordinator;
use crate::stats::IndexStats;
use crate::types::{SegmentId, Status, StatusResult};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// What a retried operation works on, for split awareness and error reports.
#[derive(Debug, Clone, Copy)]
pub enum RetryTarget<'a> {
    /// Not tied to a key or segment.
    Index,
    /// A key routed through the map.
    Key(&'a [u8]),
    /// A specific segment.
    Segment(SegmentId),
}

/// Repeats attempts that return BUSY or CLOSED until the busy timeout.
///
/// ERROR is returned at once. While a split of the target segment is in
/// flight the retry waits for it instead of spinning.
pub struct BusyRetry {
    backoff: Duration,
    timeout: Duration,
    map: Arc<KeySegmentMap>,
    splits: Arc<AsyncSplitCoordinator>,
    stats: Arc<IndexStats>,
}

impl BusyRetry {
    /// Creates a retry policy.
    pub fn new(
        backoff: Duration,
        timeout: Duration,
        map: Arc<KeySegmentMap>,
        splits: Arc<AsyncSplitCoordinator>,
        stats: Arc<IndexStats>,
    ) -> Self {
        Self {
            backoff,
            timeout,
            map,
            splits,
            stats,
        }
    }

    /// Runs `attempt` until it succeeds, fails or the busy timeout expires.
    ///
    /// # Errors
    ///
    /// `OperationFailed` for an ERROR status, `OperationTimedOut` with the
    /// last status once the timeout expired.
    pub fn run<T>(
        &self,
        operation: &'static str,
        target: RetryTarget<'_>,
        mut attempt: impl FnMut() -> StatusResult<T>,
    ) -> IndexResult<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let status = match attempt() {
                Ok(value) => return Ok(value),
                Err(status) => status,
            };
            if !status.is_retryable() {
                return Err(IndexError::from_status(
                    operation,
                    self.segment_of(target),
                    status,
                    false,
                ));
            }
            if Instant::now() >= deadline {
                return Err(IndexError::from_status(
                    operation,
                    self.segment_of(target),
                    status,
                    true,
                ));
            }
            self.stats.record_busy_retry();
            trace!(operation, %status, "retrying");
            self.pause(target, deadline);
        }
    }

    /// Polls `segment` until it is READY or CLOSED.
    ///
    /// # Errors
    ///
    /// `OperationFailed` if the segment enters ERROR, `OperationTimedOut` if
    /// maintenance or a split keeps it busy past the timeout.
    pub fn await_segment_ready(&self, operation: &'static str, segment: &SegmentRef) -> IndexResult<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match segment.state() {
                SegmentState::Ready | SegmentState::Closed => return Ok(()),
                SegmentState::Error => {
                    return Err(IndexError::from_status(
                        operation,
                        Some(segment.id()),
                        Status::Error,
                        false,
                    ))
                }
                SegmentState::MaintenanceRunning | SegmentState::Freeze => {
                    if Instant::now() >= deadline {
                        return Err(IndexError::from_status(
                            operation,
                            Some(segment.id()),
                            Status::Busy,
                            true,
                        ));
                    }
                    self.pause(RetryTarget::Segment(segment.id()), deadline);
                }
            }
        }
    }

    fn segment_of(&self, target: RetryTarget<'_>) -> Option<SegmentId> {
        match target {
            RetryTarget::Index => None,
            RetryTarget::Key(key) => self.map.find_segment_id(key),
            RetryTarget::Segment(id) => Some(id),
        }
    }

    /// Waits for a split of the target, or sleeps one backoff.
    fn pause(&self, target: RetryTarget<'_>, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let split = self
            .segment_of(target)
            .and_then(|id| self.splits.in_flight_for(id));
        match split {
            Some(handle) => {
                handle.await_completion(remaining);
            }
            None => std::thread::sleep(self.backoff.min(remaining)),
        }
    }
}

impl fmt::Debug for BusyRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyRetry")
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::index_core::test_support::{stack, Stack};
    use crate::types::key_from_u64;

    fn retry(s: &Stack, timeout: Duration) -> BusyRetry {
        BusyRetry::new(
            Duration::from_millis(1),
            timeout,
            Arc::clone(s.core.map()),
            Arc::clone(&s.splits),
            Arc::clone(&s.stats),
        )
    }

    #[test]
    fn busy_attempts_are_repeated() {
        let s = stack(&IndexConfig::default());
        let retry = retry(&s, Duration::from_secs(5));
        let mut left = 2;
        let value = retry
            .run("get", RetryTarget::Index, || {
                if left > 0 {
                    left -= 1;
                    Err(Status::Busy)
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(s.stats.busy_retries(), 2);
    }

    #[test]
    fn error_is_never_retried() {
        let s = stack(&IndexConfig::default());
        let retry = retry(&s, Duration::from_secs(5));
        let mut calls = 0;
        let err = retry
            .run("put", RetryTarget::Segment(SegmentId::new(3)), || {
                calls += 1;
                Err::<(), _>(Status::Error)
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "operation 'put' on segment-00003 failed with status ERROR"
        );
    }

    #[test]
    fn timeout_names_operation_segment_and_status() {
        let s = stack(&IndexConfig::default());
        s.core.put(&key_from_u64(1), b"v").unwrap();
        let id = s.core.map().find_segment_id(&key_from_u64(1)).unwrap();
        let retry = retry(&s, Duration::from_millis(20));

        let err = retry
            .run("put", RetryTarget::Key(&key_from_u64(1)), || {
                Err::<(), _>(Status::Closed)
            })
            .unwrap_err();
        match err {
            IndexError::OperationTimedOut {
                operation,
                segment_id,
                status,
            } => {
                assert_eq!(operation, "put");
                assert_eq!(segment_id, Some(id));
                assert_eq!(status, Status::Closed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.stats.busy_retries() > 0);
    }

    #[test]
    fn segment_polling_waits_for_ready() {
        let s = stack(&IndexConfig::default());
        s.core.put(&key_from_u64(1), b"v").unwrap();
        let id = s.core.map().find_segment_id(&key_from_u64(1)).unwrap();
        let segment = s.core.registry().get_segment(id).unwrap();
        let retry = retry(&s, Duration::from_millis(30));

        assert!(segment.try_freeze());
        let err = retry.await_segment_ready("flush", &segment).unwrap_err();
        assert!(matches!(err, IndexError::OperationTimedOut { .. }));

        let frozen = Arc::clone(&segment);
        let thaw = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            frozen.unfreeze();
        });
        let retry = BusyRetry::new(
            Duration::from_millis(1),
            Duration::from_secs(5),
            Arc::clone(s.core.map()),
            Arc::clone(&s.splits),
            Arc::clone(&s.stats),
        );
        retry.await_segment_ready("flush", &segment).unwrap();
        thaw.join().unwrap();
    }
}
