//! Index lifecycle: `OPENING -> READY -> (ERROR | CLOSED)`.
//!
//! The lifecycle owns the directory lock and admits every public operation
//! through [`IndexLifecycle::try_perform_operation`]. Admitted operations
//! hold an [`OperationGuard`] so that close can wait for them to finish.

use crate::error::{IndexError, IndexResult};
use parking_lot::{Condvar, Mutex};
use segdb_storage::{Directory, FileLock, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Name of the directory lock file.
pub const LOCK_FILE: &str = ".lock";

/// Lifecycle state of an open index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    /// Directory locked, recovery and loading in progress.
    Opening,
    /// Serving operations.
    Ready,
    /// A fatal error occurred. Operations are rejected and the lock is kept.
    Error,
    /// Closed. Terminal.
    Closed,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => f.write_str("OPENING"),
            Self::Ready => f.write_str("READY"),
            Self::Error => f.write_str("ERROR"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

struct Gate {
    state: IndexState,
    cause: Option<String>,
    in_flight: usize,
}

struct Shared {
    gate: Mutex<Gate>,
    drained: Condvar,
}

impl Shared {
    fn leave(&self) {
        let mut gate = self.gate.lock();
        gate.in_flight -= 1;
        if gate.in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

/// Proof that an operation was admitted. Released on drop.
pub struct OperationGuard {
    shared: Arc<Shared>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.shared.leave();
    }
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard").finish_non_exhaustive()
    }
}

/// State machine plus directory lock of one open index.
pub struct IndexLifecycle {
    shared: Arc<Shared>,
    lock: Mutex<Option<Box<dyn FileLock>>>,
    stale_lock_recovered: bool,
}

impl IndexLifecycle {
    /// Locks `directory` and enters OPENING.
    ///
    /// A lock file that exists without a live holder is a stale lock left by
    /// a crash; it is taken over and reported by
    /// [`stale_lock_recovered`](Self::stale_lock_recovered).
    ///
    /// # Errors
    ///
    /// Returns `DirectoryLocked` if another owner holds the lock.
    pub fn acquire(directory: &dyn Directory) -> IndexResult<Self> {
        let stale = directory.file_exists(LOCK_FILE);
        let mut lock = directory.get_lock(LOCK_FILE)?;
        match lock.lock() {
            Ok(()) => {}
            Err(StorageError::Locked(_)) => return Err(IndexError::DirectoryLocked),
            Err(err) => return Err(err.into()),
        }
        if stale {
            warn!("recovered stale directory lock");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                gate: Mutex::new(Gate {
                    state: IndexState::Opening,
                    cause: None,
                    in_flight: 0,
                }),
                drained: Condvar::new(),
            }),
            lock: Mutex::new(Some(lock)),
            stale_lock_recovered: stale,
        })
    }

    /// Returns the current state.
    pub fn state(&self) -> IndexState {
        self.shared.gate.lock().state
    }

    /// Returns true if a stale lock was taken over while opening.
    pub fn stale_lock_recovered(&self) -> bool {
        self.stale_lock_recovered
    }

    /// Returns the cause recorded when the index failed.
    pub fn fatal_cause(&self) -> Option<String> {
        self.shared.gate.lock().cause.clone()
    }

    /// Moves OPENING to READY.
    pub fn mark_ready(&self) -> bool {
        let mut gate = self.shared.gate.lock();
        if gate.state != IndexState::Opening {
            return false;
        }
        gate.state = IndexState::Ready;
        info!("index ready");
        true
    }

    /// Admits one operation.
    ///
    /// # Errors
    ///
    /// Rejects every state except READY: `IndexClosed` when closed,
    /// `IndexFailed` with the recorded cause after a fatal error and
    /// `InvalidState` while opening.
    pub fn try_perform_operation(&self) -> IndexResult<OperationGuard> {
        let mut gate = self.shared.gate.lock();
        match gate.state {
            IndexState::Ready => {
                gate.in_flight += 1;
                Ok(OperationGuard {
                    shared: Arc::clone(&self.shared),
                })
            }
            IndexState::Closed => Err(IndexError::IndexClosed),
            IndexState::Error => Err(IndexError::IndexFailed {
                cause: gate.cause.clone().unwrap_or_default(),
            }),
            state @ IndexState::Opening => Err(IndexError::InvalidState { state }),
        }
    }

    /// Moves OPENING or READY to ERROR and records `cause`.
    ///
    /// Returns false if the index already was in a terminal state.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let mut gate = self.shared.gate.lock();
        if matches!(gate.state, IndexState::Error | IndexState::Closed) {
            return false;
        }
        let cause = cause.into();
        error!(cause = %cause, "index entered ERROR state");
        gate.state = IndexState::Error;
        gate.cause = Some(cause);
        true
    }

    /// Stops admitting operations and returns the state closing started from.
    ///
    /// OPENING and READY move to CLOSED; ERROR stays ERROR.
    pub fn begin_close(&self) -> IndexState {
        let mut gate = self.shared.gate.lock();
        let previous = gate.state;
        if matches!(previous, IndexState::Opening | IndexState::Ready) {
            gate.state = IndexState::Closed;
        }
        previous
    }

    /// Returns the number of admitted operations still running.
    pub fn in_flight(&self) -> usize {
        self.shared.gate.lock().in_flight
    }

    /// Waits until every admitted operation finished. Returns false on timeout.
    pub fn await_operations(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.shared.gate.lock();
        while gate.in_flight > 0 {
            if self.shared.drained.wait_until(&mut gate, deadline).timed_out() {
                return gate.in_flight == 0;
            }
        }
        true
    }

    /// Unlocks the directory and removes the lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub fn release_lock(&self) -> IndexResult<()> {
        if let Some(mut lock) = self.lock.lock().take() {
            lock.unlock()?;
        }
        Ok(())
    }

    /// Returns true while the directory lock is held.
    pub fn holds_lock(&self) -> bool {
        self.lock.lock().as_ref().is_some_and(|lock| lock.is_locked())
    }
}

impl fmt::Debug for IndexLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexLifecycle")
            .field("state", &self.state())
            .field("stale_lock_recovered", &self.stale_lock_recovered)
            .finish_non_exhaustive()
    }
}
