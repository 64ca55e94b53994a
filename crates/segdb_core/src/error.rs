//! Error types for segdb core.

use crate::lifecycle::IndexState;
use crate::types::{SegmentId, Status};
use std::io;
use thiserror::Error;

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

fn on_segment(segment_id: &Option<SegmentId>) -> String {
    match segment_id {
        Some(id) => format!(" on {id}"),
        None => String::new(),
    }
}

/// Errors that can be raised to the embedding application.
///
/// Transient contention never shows up here directly: it is reported as a
/// [`Status`] below the façade and only becomes an error once the busy
/// timeout is exhausted.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Directory error.
    #[error("storage error: {0}")]
    Storage(#[from] segdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another owner holds the directory lock.
    #[error("Index directory is already locked.")]
    DirectoryLocked,

    /// An operation kept observing BUSY/CLOSED until the busy timeout expired.
    #[error("operation '{operation}'{} timed out with status {status}", on_segment(.segment_id))]
    OperationTimedOut {
        /// Name of the failed operation.
        operation: &'static str,
        /// Segment the operation was routed to, when known.
        segment_id: Option<SegmentId>,
        /// Last status observed.
        status: Status,
    },

    /// An operation failed with a non-retryable status.
    #[error("operation '{operation}'{} failed with status {status}", on_segment(.segment_id))]
    OperationFailed {
        /// Name of the failed operation.
        operation: &'static str,
        /// Segment the operation was routed to, when known.
        segment_id: Option<SegmentId>,
        /// Status that ended the operation.
        status: Status,
    },

    /// A persisted structure is inconsistent.
    #[error("index corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Caller passed an unusable argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The index was closed.
    #[error("index is closed")]
    IndexClosed,

    /// The index entered the ERROR state earlier and rejects all operations.
    #[error("index failed and requires operator intervention: {cause}")]
    IndexFailed {
        /// The fatal cause recorded when the index failed.
        cause: String,
    },

    /// The index is not in a state that accepts operations.
    #[error("index is not ready: state {state:?}")]
    InvalidState {
        /// State observed.
        state: IndexState,
    },
}

impl IndexError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an error for an operation that ended with `status`.
    pub fn from_status(
        operation: &'static str,
        segment_id: Option<SegmentId>,
        status: Status,
        timed_out: bool,
    ) -> Self {
        if timed_out {
            Self::OperationTimedOut {
                operation,
                segment_id,
                status,
            }
        } else {
            Self::OperationFailed {
                operation,
                segment_id,
                status,
            }
        }
    }

    /// Returns true if this error must move the index into the ERROR state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::OperationFailed { status, .. } => *status == Status::Error,
            Self::Corruption { .. } | Self::Storage(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_is_exact() {
        assert_eq!(
            IndexError::DirectoryLocked.to_string(),
            "Index directory is already locked."
        );
    }

    #[test]
    fn status_errors_name_operation_and_segment() {
        let err = IndexError::from_status("put", Some(SegmentId::new(3)), Status::Busy, true);
        assert_eq!(
            err.to_string(),
            "operation 'put' on segment-00003 timed out with status BUSY"
        );
        assert!(!err.is_fatal());

        let err = IndexError::from_status("get", None, Status::Error, false);
        assert_eq!(err.to_string(), "operation 'get' failed with status ERROR");
        assert!(err.is_fatal());
    }
}
