//! Benchmark utilities for segdb.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::Rng;
use segdb_core::{key_from_u64, IndexConfig, SegmentIndex};

/// Generate random value bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` keys in random order.
pub fn shuffled_keys(count: u64) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut keys: Vec<u64> = (1..=count).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    keys.into_iter().map(key_from_u64).collect()
}

/// Configuration used by the benchmarks: background maintenance on, splits
/// at `split_threshold` keys.
pub fn bench_config(split_threshold: usize) -> IndexConfig {
    IndexConfig::default()
        .index_name("bench")
        .max_number_of_keys_in_segment(split_threshold)
        .max_number_of_keys_in_segment_write_cache(split_threshold / 4 + 1)
        .max_number_of_segments_in_cache(64)
}

/// Opens an in-memory index holding keys `1..=count` with `value_size` byte values.
pub fn populated_index(count: u64, value_size: usize, split_threshold: usize) -> SegmentIndex {
    let index = SegmentIndex::open_in_memory(bench_config(split_threshold))
        .expect("Failed to open index");
    let value = random_data(value_size);
    for n in 1..=count {
        index.put(&key_from_u64(n), &value).expect("Failed to put");
    }
    index.flush_and_wait().expect("Failed to settle index");
    index
}
