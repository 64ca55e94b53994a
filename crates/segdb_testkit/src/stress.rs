//! Stress tests for segdb.
//!
//! These helpers drive an index from several threads while splits,
//! flushes and compactions run underneath.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segdb_core::{key_from_u64, MetricsSnapshot, SegmentIndex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
    /// Index metrics once the run finished.
    pub metrics: MetricsSnapshot,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration, metrics: MetricsSnapshot) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
            metrics,
        }
    }

    /// Prints throughput, failures and the index metrics of run `name`.
    pub fn print_summary(&self, name: &str) {
        println!(
            "[{name}] {} ops ({} failed) in {:.2?}, {:.0} ops/s, {} splits, {} busy retries",
            self.total_ops,
            self.failed_ops,
            self.duration,
            self.ops_per_second,
            self.metrics.splits_applied,
            self.metrics.busy_retries,
        );
        match serde_json::to_string_pretty(&self.metrics) {
            Ok(json) => println!("{json}"),
            Err(err) => println!("metrics unavailable: {err}"),
        }
    }
}

/// Shape of a stress workload.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Keys are drawn from `1..=key_space`.
    pub key_space: u64,
    /// Size of values in bytes.
    pub value_size: usize,
    /// Seed of the random workload.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            key_space: 1_000,
            value_size: 32,
            seed: 0x5e6d_b000,
        }
    }
}

/// Writes `operations` ascending keys from one thread.
pub fn stress_sequential_writes(index: &SegmentIndex, config: &StressConfig) -> StressTestResult {
    let value = vec![0xABu8; config.value_size];
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for n in 1..=config.operations as u64 {
        match index.put(&key_from_u64(n), &value) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed(), index.metrics_snapshot())
}

/// Random puts, gets and deletes from several threads.
///
/// Each thread owns the keys congruent to its number, so a read of a key the
/// thread wrote and never deleted must return the value it last wrote;
/// anything else counts as a failure.
pub fn stress_concurrent_mixed(index: Arc<SegmentIndex>, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let threads = config.threads.max(1) as u64;
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let index = Arc::clone(&index);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();

            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(config.seed ^ t);
                let mut written = std::collections::HashMap::new();
                for _ in 0..config.operations {
                    let n = rng.gen_range(0..config.key_space.max(threads) / threads) * threads + t + 1;
                    let key = key_from_u64(n);
                    let ok = match rng.gen_range(0..10) {
                        0..=4 => {
                            let value: Vec<u8> = (0..config.value_size).map(|_| rng.gen()).collect();
                            let ok = index.put(&key, &value).is_ok();
                            written.insert(n, Some(value));
                            ok
                        }
                        5 => {
                            let ok = index.delete(&key).is_ok();
                            written.insert(n, None);
                            ok
                        }
                        _ => match index.get(&key) {
                            Ok(value) => written.get(&n).cloned().flatten() == value,
                            Err(_) => false,
                        },
                    };
                    if ok {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
        index.metrics_snapshot(),
    )
}

/// One writer appends ascending keys (forcing max-key extensions and
/// splits) while readers keep reading keys that were already written.
///
/// Every read of a written key must find it.
pub fn stress_reads_during_splits(index: Arc<SegmentIndex>, config: &StressConfig) -> StressTestResult {
    let written = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let readers: Vec<_> = (0..config.threads.max(1) as u64)
        .map(|t| {
            let index = Arc::clone(&index);
            let written = Arc::clone(&written);
            let done = Arc::clone(&done);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let seed = config.seed ^ (t + 1);

            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                while !done.load(Ordering::Acquire) {
                    let max = written.load(Ordering::Acquire);
                    if max == 0 {
                        thread::yield_now();
                        continue;
                    }
                    let n = rng.gen_range(1..=max);
                    match index.get(&key_from_u64(n)) {
                        Ok(Some(_)) => successful.fetch_add(1, Ordering::Relaxed),
                        _ => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for n in 1..=config.operations as u64 {
        match index.put(&key_from_u64(n), &n.to_be_bytes()) {
            Ok(()) => {
                written.store(n, Ordering::Release);
                successful.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    done.store(true, Ordering::Release);

    for handle in readers {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
        index.metrics_snapshot(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::small_config;
    use crate::logging::init_test_logging;

    fn create_test_index() -> SegmentIndex {
        init_test_logging();
        SegmentIndex::open_in_memory(small_config()).expect("Failed to create index")
    }

    #[test]
    fn test_sequential_writes() {
        let index = create_test_index();
        let config = StressConfig {
            operations: 500,
            value_size: 16,
            ..Default::default()
        };

        let result = stress_sequential_writes(&index, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 500);
        index.flush_and_wait().unwrap();
        assert!(index.metrics_snapshot().splits_applied > 0);
    }

    #[test]
    fn test_concurrent_mixed() {
        let index = Arc::new(create_test_index());
        let config = StressConfig {
            operations: 400,
            threads: 4,
            key_space: 200,
            ..Default::default()
        };

        let result = stress_concurrent_mixed(Arc::clone(&index), &config);
        result.print_summary("concurrent_mixed");
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, 1_600);
        index.flush_and_wait().unwrap();
    }

    #[test]
    fn test_reads_during_splits() {
        let index = Arc::new(create_test_index());
        let config = StressConfig {
            operations: 400,
            threads: 3,
            ..Default::default()
        };

        let result = stress_reads_during_splits(Arc::clone(&index), &config);
        assert_eq!(result.failed_ops, 0);
        index.flush_and_wait().unwrap();
        assert!(index.metrics_snapshot().splits_applied > 0);
    }
}
