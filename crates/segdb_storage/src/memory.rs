//! In-memory directory for testing.

use crate::directory::{Directory, FileLock};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<String, Vec<u8>>,
    held_locks: HashSet<String>,
}

/// An in-memory directory.
///
/// This directory stores all files in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral indexes that don't need persistence
///
/// Clones share the same contents, so a test can "reopen" an index on the
/// same directory after closing or abandoning the first instance.
///
/// # Example
///
/// ```rust
/// use segdb_storage::{Directory, MemDirectory};
///
/// let dir = MemDirectory::new();
/// let reopened = dir.clone();
/// dir.write_file("a", b"test data").unwrap();
/// assert_eq!(reopened.read_file("a").unwrap(), b"test data");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemDirectory {
    state: Arc<RwLock<MemState>>,
}

impl MemDirectory {
    /// Creates a new empty in-memory directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of bytes stored.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.state.read().files.values().map(Vec::len).sum()
    }
}

impl Directory for MemDirectory {
    fn read_file(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.state
            .read()
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn write_file(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        self.state
            .write()
            .files
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.state.read().files.contains_key(name)
    }

    fn rename_file(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut state = self.state.write();
        let data = state
            .files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        state.files.insert(to.to_string(), data);
        Ok(())
    }

    fn delete_file(&self, name: &str) -> StorageResult<bool> {
        Ok(self.state.write().files.remove(name).is_some())
    }

    fn list_files(&self) -> StorageResult<Vec<String>> {
        Ok(self.state.read().files.keys().cloned().collect())
    }

    fn get_lock(&self, name: &str) -> StorageResult<Box<dyn FileLock>> {
        Ok(Box::new(MemFileLock {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            held: false,
        }))
    }
}

#[derive(Debug)]
struct MemFileLock {
    name: String,
    state: Arc<RwLock<MemState>>,
    held: bool,
}

impl FileLock for MemFileLock {
    fn lock(&mut self) -> StorageResult<()> {
        if self.held {
            return Ok(());
        }

        let mut state = self.state.write();
        if !state.held_locks.insert(self.name.clone()) {
            return Err(StorageError::Locked(self.name.clone()));
        }
        state
            .files
            .insert(self.name.clone(), std::process::id().to_string().into_bytes());
        self.held = true;
        Ok(())
    }

    fn unlock(&mut self) -> StorageResult<()> {
        if !self.held {
            return Ok(());
        }

        let mut state = self.state.write();
        state.files.remove(&self.name);
        state.held_locks.remove(&self.name);
        self.held = false;
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.held
    }
}

impl Drop for MemFileLock {
    fn drop(&mut self) {
        // Mirror a crashed holder: the lock goes away, the lock file stays
        if self.held {
            self.state.write().held_locks.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn write_read_delete() {
        let dir = MemDirectory::new();
        dir.write_file("a", b"one").unwrap();

        assert!(dir.file_exists("a"));
        assert_eq!(dir.read_file("a").unwrap(), b"one");
        assert_eq!(dir.total_size(), 3);

        assert!(dir.delete_file("a").unwrap());
        assert!(matches!(dir.read_file("a"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn clones_share_contents() {
        let dir = MemDirectory::new();
        let other = dir.clone();

        dir.write_file("x", b"1").unwrap();
        other.rename_file("x", "y").unwrap();

        assert_eq!(dir.list_files().unwrap(), vec!["y"]);
    }

    #[test]
    fn lock_is_exclusive_across_clones() {
        let dir = MemDirectory::new();
        let mut first = dir.get_lock(".lock").unwrap();
        first.lock().unwrap();

        let mut second = dir.clone().get_lock(".lock").unwrap();
        assert!(matches!(second.lock(), Err(StorageError::Locked(_))));

        first.unlock().unwrap();
        assert!(!dir.file_exists(".lock"));
        second.lock().unwrap();
        assert!(second.is_locked());
    }

    #[test]
    fn dropped_lock_leaves_file_but_releases() {
        let dir = MemDirectory::new();
        {
            let mut lock = dir.get_lock(".lock").unwrap();
            lock.lock().unwrap();
        }

        assert!(dir.file_exists(".lock"));
        let mut again = dir.get_lock(".lock").unwrap();
        again.lock().unwrap();
    }

    proptest! {
        #[test]
        fn listing_is_sorted(names in prop::collection::btree_set("[a-z]{1,8}", 0..20)) {
            let dir = MemDirectory::new();
            for name in names.iter().rev() {
                dir.write_file(name, b"").unwrap();
            }
            let listed = dir.list_files().unwrap();
            let expected: Vec<String> = names.into_iter().collect();
            prop_assert_eq!(listed, expected);
        }
    }
}
