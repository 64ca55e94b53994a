//! Directory and file-lock trait definitions.

use crate::error::StorageResult;
use std::fmt;

/// A flat namespace of named files owned by one index.
///
/// Directories are **opaque byte stores**. They read and write whole files,
/// rename and delete them, and hand out advisory locks. The index owns all
/// file format interpretation.
///
/// # Invariants
///
/// - `write_file` replaces the named file atomically: readers observe either
///   the previous contents or the new contents, never a mix
/// - `write_file` returns only after the contents are durable
/// - `list_files` never reports temporary files left behind by `write_file`
/// - Directories must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemDirectory`] - For testing
/// - [`super::FsDirectory`] - For persistent storage
pub trait Directory: Send + Sync + fmt::Debug {
    /// Reads the whole contents of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the file does not exist.
    fn read_file(&self, name: &str) -> StorageResult<Vec<u8>>;

    /// Atomically replaces the contents of `name` with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or synced.
    fn write_file(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Returns true if `name` exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Renames `from` to `to`, replacing `to` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if `from` does not exist.
    fn rename_file(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Deletes `name`. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn delete_file(&self, name: &str) -> StorageResult<bool>;

    /// Lists the names of all files, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list_files(&self) -> StorageResult<Vec<String>>;

    /// Returns an (unlocked) handle for the advisory lock `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock handle cannot be created.
    fn get_lock(&self, name: &str) -> StorageResult<Box<dyn FileLock>>;
}

/// An advisory, exclusive lock backed by a file in a [`Directory`].
///
/// `lock` creates the lock file and records the holder's process id;
/// `unlock` releases the lock and deletes the file. Dropping a locked
/// handle without `unlock` releases the lock but **leaves the file behind**,
/// which is how a crashed holder looks to the next opener.
pub trait FileLock: Send + Sync + fmt::Debug {
    /// Acquires the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Locked`] if another handle holds it.
    fn lock(&mut self) -> StorageResult<()>;

    /// Releases the lock and removes the lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    fn unlock(&mut self) -> StorageResult<()>;

    /// Returns true while this handle holds the lock.
    fn is_locked(&self) -> bool;
}
