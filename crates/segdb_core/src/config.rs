//! Index configuration.

use crate::error::{IndexError, IndexResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for opening a segment index.
///
/// Values are consumed as plain thresholds by every component; loading them
/// from a file is up to the embedder (the struct is serde-friendly).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Name used in log spans and pool thread names.
    pub index_name: String,

    /// Live key count at which a segment is split.
    pub max_number_of_keys_in_segment: usize,

    /// Write-cache size at which a segment is flushed.
    pub max_number_of_keys_in_segment_write_cache: usize,

    /// Delta file count at which a segment is compacted.
    pub max_number_of_delta_files: usize,

    /// Number of open segments kept in the registry cache.
    pub max_number_of_segments_in_cache: usize,

    /// Minimum estimated key count for a split to be attempted.
    pub min_keys_to_split: usize,

    /// Sleep between two attempts of a busy operation.
    pub busy_backoff: Duration,

    /// Total time an operation may keep observing BUSY before it fails.
    pub busy_timeout: Duration,

    /// Lazy map changes accumulated before the map file is rewritten.
    pub map_flush_batch: usize,

    /// Threads serving async get/put/delete.
    pub number_of_io_threads: usize,

    /// Threads running segment flush and compaction.
    pub number_of_maintenance_threads: usize,

    /// Threads running split pipelines.
    pub number_of_split_threads: usize,

    /// Threads closing evicted segments.
    pub number_of_registry_lifecycle_threads: usize,

    /// Bounded queue length of every worker pool.
    pub executor_queue_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_name: "segdb".to_string(),
            max_number_of_keys_in_segment: 500_000,
            max_number_of_keys_in_segment_write_cache: 10_000,
            max_number_of_delta_files: 8,
            max_number_of_segments_in_cache: 10,
            min_keys_to_split: 2,
            busy_backoff: Duration::from_millis(2),
            busy_timeout: Duration::from_secs(30),
            map_flush_batch: 64,
            number_of_io_threads: 2,
            number_of_maintenance_threads: 1,
            number_of_split_threads: 1,
            number_of_registry_lifecycle_threads: 1,
            executor_queue_capacity: 1024,
        }
    }
}

impl IndexConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the index name.
    #[must_use]
    pub fn index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = name.into();
        self
    }

    /// Sets the split threshold.
    #[must_use]
    pub const fn max_number_of_keys_in_segment(mut self, value: usize) -> Self {
        self.max_number_of_keys_in_segment = value;
        self
    }

    /// Sets the write-cache flush threshold.
    #[must_use]
    pub const fn max_number_of_keys_in_segment_write_cache(mut self, value: usize) -> Self {
        self.max_number_of_keys_in_segment_write_cache = value;
        self
    }

    /// Sets the delta-file compaction threshold.
    #[must_use]
    pub const fn max_number_of_delta_files(mut self, value: usize) -> Self {
        self.max_number_of_delta_files = value;
        self
    }

    /// Sets the registry cache capacity.
    #[must_use]
    pub const fn max_number_of_segments_in_cache(mut self, value: usize) -> Self {
        self.max_number_of_segments_in_cache = value;
        self
    }

    /// Sets the split feasibility minimum.
    #[must_use]
    pub const fn min_keys_to_split(mut self, value: usize) -> Self {
        self.min_keys_to_split = value;
        self
    }

    /// Sets the busy backoff.
    #[must_use]
    pub const fn busy_backoff(mut self, value: Duration) -> Self {
        self.busy_backoff = value;
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, value: Duration) -> Self {
        self.busy_timeout = value;
        self
    }

    /// Sets how many lazy map changes are batched per map write.
    #[must_use]
    pub const fn map_flush_batch(mut self, value: usize) -> Self {
        self.map_flush_batch = value;
        self
    }

    /// Sets the IO pool size.
    #[must_use]
    pub const fn number_of_io_threads(mut self, value: usize) -> Self {
        self.number_of_io_threads = value;
        self
    }

    /// Sets the maintenance pool size.
    #[must_use]
    pub const fn number_of_maintenance_threads(mut self, value: usize) -> Self {
        self.number_of_maintenance_threads = value;
        self
    }

    /// Sets the split pool size.
    #[must_use]
    pub const fn number_of_split_threads(mut self, value: usize) -> Self {
        self.number_of_split_threads = value;
        self
    }

    /// Sets the registry lifecycle pool size.
    #[must_use]
    pub const fn number_of_registry_lifecycle_threads(mut self, value: usize) -> Self {
        self.number_of_registry_lifecycle_threads = value;
        self
    }

    /// Sets the queue capacity of every pool.
    #[must_use]
    pub const fn executor_queue_capacity(mut self, value: usize) -> Self {
        self.executor_queue_capacity = value;
        self
    }

    /// Checks that every threshold is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> IndexResult<()> {
        if self.index_name.trim().is_empty() {
            return Err(IndexError::invalid_config("index_name must not be empty"));
        }
        let positive = [
            ("max_number_of_keys_in_segment", self.max_number_of_keys_in_segment),
            (
                "max_number_of_keys_in_segment_write_cache",
                self.max_number_of_keys_in_segment_write_cache,
            ),
            ("max_number_of_delta_files", self.max_number_of_delta_files),
            ("max_number_of_segments_in_cache", self.max_number_of_segments_in_cache),
            ("min_keys_to_split", self.min_keys_to_split),
            ("map_flush_batch", self.map_flush_batch),
            ("number_of_io_threads", self.number_of_io_threads),
            ("number_of_maintenance_threads", self.number_of_maintenance_threads),
            ("number_of_split_threads", self.number_of_split_threads),
            (
                "number_of_registry_lifecycle_threads",
                self.number_of_registry_lifecycle_threads,
            ),
            ("executor_queue_capacity", self.executor_queue_capacity),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(IndexError::invalid_config(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.min_keys_to_split < 2 {
            return Err(IndexError::invalid_config(
                "min_keys_to_split must be at least 2",
            ));
        }
        if self.busy_timeout.is_zero() {
            return Err(IndexError::invalid_config(
                "busy_timeout must be greater than zero",
            ));
        }
        if self.busy_backoff > self.busy_timeout {
            return Err(IndexError::invalid_config(
                "busy_backoff must not exceed busy_timeout",
            ));
        }
        Ok(())
    }
}
