//! Test fixtures and index helpers.
//!
//! Provides convenience functions for setting up test indexes
//! and common test scenarios.

use segdb_core::{IndexConfig, SegmentIndex, LOCK_FILE};
use segdb_storage::{Directory, FsDirectory, MemDirectory};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration with thresholds small enough that a few dozen writes
/// exercise flushes, compactions and splits.
pub fn small_config() -> IndexConfig {
    IndexConfig::default()
        .index_name("test")
        .max_number_of_keys_in_segment(8)
        .max_number_of_keys_in_segment_write_cache(4)
        .max_number_of_delta_files(3)
        .max_number_of_segments_in_cache(4)
        .busy_timeout(Duration::from_secs(10))
}

/// A test index with automatic cleanup.
pub struct TestIndex {
    /// The index instance.
    pub index: SegmentIndex,
    /// The directory the index lives in.
    pub directory: Arc<dyn Directory>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestIndex {
    /// Creates a new in-memory test index.
    pub fn memory(config: IndexConfig) -> Self {
        let directory: Arc<dyn Directory> = Arc::new(MemDirectory::new());
        Self {
            index: SegmentIndex::open(Arc::clone(&directory), config)
                .expect("Failed to open in-memory index"),
            directory,
            _temp_dir: None,
        }
    }

    /// Creates a new index in a temporary directory on disk.
    pub fn file(config: IndexConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let directory: Arc<dyn Directory> =
            Arc::new(FsDirectory::open(temp_dir.path()).expect("Failed to open directory"));
        Self {
            index: SegmentIndex::open(Arc::clone(&directory), config)
                .expect("Failed to open file index"),
            directory,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the directory path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Closes the index cleanly and opens it again on the same directory.
    pub fn reopen(self) -> Self {
        let Self {
            index,
            directory,
            _temp_dir,
        } = self;
        let config = index.config().clone();
        index.close().expect("Failed to close index");
        drop(index);

        Self {
            index: SegmentIndex::open(Arc::clone(&directory), config)
                .expect("Failed to reopen index"),
            directory,
            _temp_dir,
        }
    }

    /// Closes the index, then leaves a lock file behind as a crashed owner
    /// would, and opens the index again.
    pub fn reopen_after_crash(self) -> Self {
        let Self {
            index,
            directory,
            _temp_dir,
        } = self;
        let config = index.config().clone();
        index.close().expect("Failed to close index");
        drop(index);
        leave_stale_lock(directory.as_ref());

        Self {
            index: SegmentIndex::open(Arc::clone(&directory), config)
                .expect("Failed to reopen index after crash"),
            directory,
            _temp_dir,
        }
    }
}

impl std::ops::Deref for TestIndex {
    type Target = SegmentIndex;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

/// Writes a lock file nobody holds, as left behind by a crashed process.
pub fn leave_stale_lock(directory: &dyn Directory) {
    directory
        .write_file(LOCK_FILE, b"4194304\n")
        .expect("Failed to write stale lock file");
}

/// Runs a test with a temporary in-memory index.
///
/// # Example
///
/// ```rust
/// use segdb_testkit::{small_config, with_temp_index};
///
/// with_temp_index(small_config(), |index| {
///     index.put(b"k", b"v").unwrap();
/// });
/// ```
pub fn with_temp_index<F, R>(config: IndexConfig, f: F) -> R
where
    F: FnOnce(&SegmentIndex) -> R,
{
    let test_index = TestIndex::memory(config);
    f(&test_index.index)
}

/// Runs a test with a temporary on-disk index.
pub fn with_file_index<F, R>(config: IndexConfig, f: F) -> R
where
    F: FnOnce(&SegmentIndex, &std::path::Path) -> R,
{
    let test_index = TestIndex::file(config);
    let path = test_index.path().expect("File index should have a path");
    f(&test_index.index, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use segdb_core::key_from_u64;

    /// Value stored for key `n` by the populated scenarios.
    pub fn value_for(n: u64) -> Vec<u8> {
        format!("value-{n}").into_bytes()
    }

    /// Creates an index holding keys `1..=count` and waits until splits and
    /// maintenance settled.
    pub fn populated_index(count: u64, config: IndexConfig) -> TestIndex {
        let test_index = TestIndex::memory(config);
        for n in 1..=count {
            test_index
                .put(&key_from_u64(n), &value_for(n))
                .expect("Failed to put key");
        }
        test_index
            .flush_and_wait()
            .expect("Failed to settle index");
        test_index
    }
}
