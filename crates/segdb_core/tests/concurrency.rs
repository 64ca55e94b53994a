//! Routing and write visibility under concurrent splits.

use segdb_core::{
    key_from_u64, key_to_u64, ExecutorRegistry, IndexConfig, IndexStats, KeySegmentMap,
    LsmSegmentFactory, SegmentId, SegmentIndex, SegmentRegistry, SplitApplyPlan, SplitStatus,
};
use segdb_storage::{Directory, MemDirectory};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::Span;

const WRITER_KEYS: u64 = 2_000;

fn registry_over(directory: Arc<dyn Directory>, config: &IndexConfig) -> SegmentRegistry {
    let lease = ExecutorRegistry::global()
        .lease("segdb-test-registry", 1, 64)
        .unwrap();
    SegmentRegistry::new(
        Arc::new(LsmSegmentFactory::new(directory)),
        config,
        lease,
        Arc::new(IndexStats::new()),
        Span::none(),
        SegmentId::new(100),
    )
}

/// Builds a plan that halves the last map entry, if its range allows it.
fn halve_last_entry(map: &KeySegmentMap, next_id: &mut u64) -> Option<SplitApplyPlan> {
    let snapshot = map.snapshot();
    let entries = snapshot.entries();
    let (old_max, old_id) = entries.last()?;
    let lower_bound = match entries.len() {
        1 => 0,
        len => key_to_u64(&entries[len - 2].0)?,
    };
    let upper_bound = key_to_u64(old_max)?;
    if upper_bound - lower_bound < 2 {
        return None;
    }
    let boundary = lower_bound + (upper_bound - lower_bound) / 2;
    let lower = SegmentId::new(*next_id);
    let upper = SegmentId::new(*next_id + 1);
    *next_id += 2;
    Some(SplitApplyPlan {
        old_segment_id: *old_id,
        lower_segment_id: lower,
        upper_segment_id: Some(upper),
        min_key: key_from_u64(lower_bound + 1),
        max_key: key_from_u64(boundary),
        status: SplitStatus::Split,
    })
}

#[test]
fn routed_keys_stay_routed_while_map_changes() {
    let directory: Arc<dyn Directory> = Arc::new(MemDirectory::new());
    let config = IndexConfig::default();
    let map = Arc::new(KeySegmentMap::open(Arc::clone(&directory), 64).unwrap());
    let registry = Arc::new(registry_over(Arc::clone(&directory), &config));
    map.insert_segment(key_from_u64(10), SegmentId::FIRST).unwrap();

    let published = Arc::new(AtomicU64::new(10));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let map = Arc::clone(&map);
        let published = Arc::clone(&published);
        thread::spawn(move || {
            for n in 11..=WRITER_KEYS {
                let key = key_from_u64(n);
                while !map.try_extend_max_key(&key, &map.snapshot()) {
                    thread::yield_now();
                }
                published.store(n, Ordering::Release);
            }
        })
    };

    let splitter = {
        let map = Arc::clone(&map);
        let registry = Arc::clone(&registry);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut next_id = 2;
            let mut applied = 0;
            while !done.load(Ordering::Acquire) {
                let Ok(guard) = registry.try_enter_freeze() else {
                    thread::yield_now();
                    continue;
                };
                if let Some(plan) = halve_last_entry(&map, &mut next_id) {
                    // only the writer runs concurrently and it only grows
                    // the last entry, so the plan must fit
                    assert!(map.apply_split_plan(&plan, &guard));
                    applied += 1;
                }
                guard.finish();
                thread::sleep(Duration::from_micros(200));
            }
            applied
        })
    };

    let readers: Vec<_> = (0..3u64)
        .map(|t| {
            let map = Arc::clone(&map);
            let published = Arc::clone(&published);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut i = t;
                let mut reads = 0u64;
                while !done.load(Ordering::Acquire) {
                    let max = published.load(Ordering::Acquire);
                    let n = (i * 7_919) % max + 1;
                    i += 1;
                    assert!(
                        map.find_segment_id(&key_from_u64(n)).is_some(),
                        "key {n} lost its route (max {max})"
                    );
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    writer.join().unwrap();
    thread::sleep(Duration::from_millis(20));
    done.store(true, Ordering::Release);

    let applied = splitter.join().unwrap();
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert!(applied > 0);

    let snapshot = map.snapshot();
    assert_eq!(snapshot.max_key(), Some(key_from_u64(WRITER_KEYS).as_slice()));
    assert_eq!(snapshot.len(), applied + 1);
    assert!(snapshot.entries().windows(2).all(|pair| pair[0].0 < pair[1].0));
    let mut ids = snapshot.segment_ids();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), snapshot.len());
    for n in 1..=WRITER_KEYS {
        assert!(snapshot.find_segment_id(&key_from_u64(n)).is_some());
    }
}

#[test]
fn concurrent_writers_survive_splits() {
    let index = Arc::new(
        SegmentIndex::open_in_memory(
            IndexConfig::default()
                .index_name("concurrent")
                .max_number_of_keys_in_segment(6)
                .max_number_of_keys_in_segment_write_cache(3)
                .busy_timeout(Duration::from_secs(10)),
        )
        .unwrap(),
    );
    let threads = 4u64;
    let per_thread = 150u64;

    let writers: Vec<_> = (0..threads)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for round in 0..2u64 {
                    for i in 0..per_thread {
                        let n = i * threads + t + 1;
                        let value = [round as u8, t as u8];
                        index.put(&key_from_u64(n), &value).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    index.flush_and_wait().unwrap();

    assert!(index.segment_ids().len() > 1);
    assert!(index.metrics_snapshot().splits_applied > 0);
    for n in 1..=threads * per_thread {
        let t = (n - 1) % threads;
        assert_eq!(
            index.get(&key_from_u64(n)).unwrap(),
            Some(vec![1, t as u8]),
            "key {n} does not hold its last write"
        );
    }
}

#[test]
fn concurrent_deletes_during_splits_are_not_lost() {
    let index = Arc::new(
        SegmentIndex::open_in_memory(
            IndexConfig::default()
                .index_name("deletes")
                .max_number_of_keys_in_segment(5)
                .busy_timeout(Duration::from_secs(10)),
        )
        .unwrap(),
    );
    for n in 1..=200 {
        index.put(&key_from_u64(n), b"v").unwrap();
    }

    let deleter = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for n in (2..=200).step_by(2) {
                index.delete(&key_from_u64(n)).unwrap();
            }
        })
    };
    let appender = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for n in 201..=300 {
                index.put(&key_from_u64(n), b"w").unwrap();
            }
        })
    };
    deleter.join().unwrap();
    appender.join().unwrap();
    index.flush_and_wait().unwrap();

    for n in 1..=200u64 {
        let expected = (n % 2 == 1).then(|| b"v".to_vec());
        assert_eq!(index.get(&key_from_u64(n)).unwrap(), expected, "key {n}");
    }
    for n in 201..=300 {
        assert_eq!(index.get(&key_from_u64(n)).unwrap(), Some(b"w".to_vec()));
    }
}
