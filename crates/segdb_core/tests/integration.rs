//! End-to-end tests for the index facade.

use segdb_core::{
    key_from_u64, IndexConfig, IndexError, IndexState, Isolation, SegmentIndex, SegmentWindow,
    LOCK_FILE,
};
use segdb_storage::{Directory, MemDirectory};
use std::sync::Arc;
use std::time::Duration;

fn config(split_threshold: usize) -> IndexConfig {
    IndexConfig::default()
        .index_name("integration")
        .max_number_of_keys_in_segment(split_threshold)
        .max_number_of_keys_in_segment_write_cache(2)
        .busy_timeout(Duration::from_secs(10))
}

fn memory() -> Arc<dyn Directory> {
    Arc::new(MemDirectory::new())
}

#[test]
fn small_threshold_splits_into_two_segments() {
    let index = SegmentIndex::open(memory(), config(4)).unwrap();
    for n in 1..=5 {
        index.put(&key_from_u64(n), format!("v{n}").as_bytes()).unwrap();
    }
    index.flush_and_wait().unwrap();

    assert_eq!(index.segment_ids().len(), 2);
    for n in 1..=5 {
        assert_eq!(
            index.get(&key_from_u64(n)).unwrap(),
            Some(format!("v{n}").into_bytes())
        );
    }
    assert!(index.metrics_snapshot().splits_applied >= 1);
}

#[test]
fn close_waits_for_async_writes() {
    let directory = memory();
    let index = SegmentIndex::open(Arc::clone(&directory), config(16)).unwrap();

    let handles: Vec<_> = (1..=200u64)
        .map(|n| index.put_async(key_from_u64(n), n.to_be_bytes().to_vec()))
        .collect();
    index.close().unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!directory.file_exists(LOCK_FILE));

    let reopened = SegmentIndex::open(directory, config(16)).unwrap();
    for n in 1..=200u64 {
        assert_eq!(
            reopened.get(&key_from_u64(n)).unwrap(),
            Some(n.to_be_bytes().to_vec()),
            "key {n} lost across close"
        );
    }
}

#[test]
fn second_open_is_refused_while_locked() {
    let directory = memory();
    let index = SegmentIndex::open(Arc::clone(&directory), config(8)).unwrap();

    let err = SegmentIndex::open(Arc::clone(&directory), config(8)).unwrap_err();
    assert!(matches!(err, IndexError::DirectoryLocked));
    assert_eq!(err.to_string(), "Index directory is already locked.");

    index.close().unwrap();
    let index = SegmentIndex::open(directory, config(8)).unwrap();
    assert!(!index.stale_lock_recovered());
}

#[test]
fn stale_lock_triggers_consistency_check() {
    let directory = memory();
    let index = SegmentIndex::open(Arc::clone(&directory), config(8)).unwrap();
    for n in 1..=20 {
        index.put(&key_from_u64(n), b"v").unwrap();
    }
    index.close().unwrap();
    directory.write_file(LOCK_FILE, b"999999\n").unwrap();

    let index = SegmentIndex::open(directory, config(8)).unwrap();
    assert!(index.stale_lock_recovered());
    assert_eq!(index.state(), IndexState::Ready);
    assert_eq!(index.metrics_snapshot().consistency_checks, 1);
    for n in 1..=20 {
        assert_eq!(index.get(&key_from_u64(n)).unwrap(), Some(b"v".to_vec()));
    }
}

#[test]
fn clean_open_skips_consistency_check() {
    let index = SegmentIndex::open(memory(), config(8)).unwrap();
    assert_eq!(index.metrics_snapshot().consistency_checks, 0);
}

#[test]
fn consistency_repair_removes_empty_segments() {
    let index = SegmentIndex::open(memory(), config(100)).unwrap();
    for n in 1..=3 {
        index.put(&key_from_u64(n), b"v").unwrap();
    }
    for n in 1..=3 {
        index.delete(&key_from_u64(n)).unwrap();
    }
    let routed = index.segment_ids();
    assert_eq!(routed.len(), 1);

    let report = index.check_and_repair_consistency().unwrap();
    assert_eq!(report.removed, routed);
    assert!(index.segment_ids().is_empty());
    assert_eq!(index.metrics_snapshot().consistency_repairs, 1);

    // the map bootstraps again on the next write
    index.put(&key_from_u64(7), b"seven").unwrap();
    assert_eq!(index.get(&key_from_u64(7)).unwrap(), Some(b"seven".to_vec()));
    assert_eq!(index.segment_ids().len(), 1);
}

#[test]
fn consistent_index_needs_no_repair() {
    let index = SegmentIndex::open(memory(), config(4)).unwrap();
    for n in 1..=30 {
        index.put(&key_from_u64(n), b"v").unwrap();
    }
    let report = index.check_and_repair_consistency().unwrap();
    assert_eq!(report.repairs(), 0);
    assert_eq!(report.checked, index.segment_ids().len());
}

#[test]
fn stream_windows_select_segments() {
    let index = SegmentIndex::open(memory(), config(4)).unwrap();
    for n in 1..=24 {
        index.put(&key_from_u64(n), b"v").unwrap();
    }
    index.flush_and_wait().unwrap();
    let segments = index.segment_ids().len();
    assert!(segments > 2);

    let count = |window| {
        index
            .get_stream(window, Isolation::FullIsolation)
            .unwrap()
            .map(|entry| entry.unwrap())
            .count()
    };
    assert_eq!(count(SegmentWindow::all()), 24);
    let first_two = count(SegmentWindow::new(0, 2));
    let rest = count(SegmentWindow::from_offset(2));
    assert_eq!(first_two + rest, 24);
    assert_eq!(count(SegmentWindow::new(segments, 1)), 0);
}

#[test]
fn on_disk_index_survives_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let index = SegmentIndex::open_path(temp.path(), config(4)).unwrap();
    assert!(temp.path().join(LOCK_FILE).exists());
    for n in 1..=12 {
        index.put(&key_from_u64(n), &n.to_be_bytes()).unwrap();
    }
    index.flush_and_wait().unwrap();
    let segments = index.segment_ids();
    index.close().unwrap();
    assert!(!temp.path().join(LOCK_FILE).exists());
    assert!(temp.path().join("index.map").exists());

    let index = SegmentIndex::open_path(temp.path(), config(4)).unwrap();
    assert_eq!(index.segment_ids(), segments);
    for n in 1..=12u64 {
        assert_eq!(index.get(&key_from_u64(n)).unwrap(), Some(n.to_be_bytes().to_vec()));
    }
}
