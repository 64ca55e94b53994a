//! Error types for directory operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during directory operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The named file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The named lock is held by another owner.
    #[error("lock already held: {0}")]
    Locked(String),

    /// A file's contents are malformed.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The directory or lock handle is closed.
    #[error("storage is closed")]
    Closed,
}
