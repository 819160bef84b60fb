//! Integration tests for checkpointing and log restarts

use std::path::Path;
use std::sync::Arc;

use lode::btree::{BTree, Key, TreeKind};
use lode::common::{LodeError, PageNumber, PagerConfig};
use lode::lock::MemoryLockTable;
use lode::pager::Pager;
use lode::storage::disk::sidecar_path;
use lode::wal::{CheckpointMode, CheckpointWorker, WAL_HEADER_SIZE};
use tempfile::tempdir;

fn config() -> PagerConfig {
    PagerConfig::default()
        .with_page_size(512)
        .with_wal_autocheckpoint(0)
}

fn connect(path: &Path, table: &Arc<MemoryLockTable>, config: PagerConfig) -> Arc<Pager> {
    Arc::new(Pager::open_with_lock_manager(path, config, Box::new(table.connect())).unwrap())
}

fn put(pager: &Arc<Pager>, rowid: i64, value: &[u8]) {
    pager.begin_write().unwrap();
    BTree::open(Arc::clone(pager), PageNumber::new(1), TreeKind::Table)
        .insert(&Key::Row(rowid), value)
        .unwrap();
    pager.commit().unwrap();
}

fn get(pager: &Arc<Pager>, rowid: i64) -> Option<Vec<u8>> {
    BTree::open(Arc::clone(pager), PageNumber::new(1), TreeKind::Table)
        .get(&Key::Row(rowid))
        .unwrap()
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[test]
fn test_passive_checkpoint_stops_at_oldest_reader() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let table = MemoryLockTable::new();
    let writer = connect(&path, &table, config());
    let reader = connect(&path, &table, config());

    put(&writer, 1, b"old");
    reader.begin_read().unwrap();
    let pinned = reader.snapshot().unwrap().max_frame;
    put(&writer, 1, b"new");
    put(&writer, 2, b"more");

    let result = writer.checkpoint(CheckpointMode::Passive).unwrap();
    assert_eq!(result.wal_frames, writer.wal_frame_count());
    assert_eq!(result.backfilled, pinned);
    assert!(!result.is_complete());

    // the copied prefix does not disturb the reader's view
    assert_eq!(get(&reader, 1), Some(b"old".to_vec()));
    assert_eq!(get(&reader, 2), None);
    reader.end_read().unwrap();

    let result = writer.checkpoint(CheckpointMode::Passive).unwrap();
    assert!(result.is_complete());
    assert!(file_len(&path) >= 512);
}

#[test]
fn test_waiting_modes_report_busy_while_readers_hold_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let table = MemoryLockTable::new();
    let writer = connect(&path, &table, config());
    let reader = connect(&path, &table, config());

    put(&writer, 1, b"a");
    reader.begin_read().unwrap();
    put(&writer, 2, b"b");

    // an older snapshot keeps FULL from copying everything
    assert!(matches!(
        writer.checkpoint(CheckpointMode::Full),
        Err(LodeError::Busy)
    ));
    reader.end_read().unwrap();

    // a reader of the newest snapshot lets FULL finish but blocks a restart
    reader.begin_read().unwrap();
    let result = writer.checkpoint(CheckpointMode::Full).unwrap();
    assert!(result.is_complete());
    assert!(matches!(
        writer.checkpoint(CheckpointMode::Restart),
        Err(LodeError::Busy)
    ));
    assert_eq!(get(&reader, 2), Some(b"b".to_vec()));
    reader.end_read().unwrap();

    writer.checkpoint(CheckpointMode::Restart).unwrap();
    assert_eq!(writer.wal_frame_count(), 0);
    assert_eq!(file_len(&sidecar_path(&path, "-wal")), WAL_HEADER_SIZE as u64);

    reader.begin_read().unwrap();
    assert_eq!(get(&reader, 1), Some(b"a".to_vec()));
    assert_eq!(get(&reader, 2), Some(b"b".to_vec()));
    reader.end_read().unwrap();
}

#[test]
fn test_full_checkpoint_waits_for_writer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let table = MemoryLockTable::new();
    let writer = connect(&path, &table, config());
    let other = connect(&path, &table, config());

    put(&writer, 1, b"committed");
    writer.begin_write().unwrap();

    assert!(matches!(
        other.checkpoint(CheckpointMode::Full),
        Err(LodeError::Busy)
    ));
    // PASSIVE copies committed frames even with a writer active
    assert!(other.checkpoint(CheckpointMode::Passive).unwrap().is_complete());
    writer.rollback().unwrap();

    assert!(other.checkpoint(CheckpointMode::Full).unwrap().is_complete());
}

#[test]
fn test_fully_checkpointed_log_is_read_from_main_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let table = MemoryLockTable::new();
    let writer = connect(&path, &table, config());
    let reader = connect(&path, &table, config());

    for rowid in 0..20 {
        put(&writer, rowid, &[rowid as u8; 40]);
    }
    let frames = writer.wal_frame_count();
    assert!(writer.checkpoint(CheckpointMode::Passive).unwrap().is_complete());

    reader.begin_read().unwrap();
    assert!(reader.snapshot().unwrap().reads_main_file_only());
    for rowid in 0..20 {
        assert_eq!(get(&reader, rowid), Some(vec![rowid as u8; 40]));
    }
    reader.end_read().unwrap();

    // the next writer starts the log over instead of appending to it
    put(&writer, 100, b"fresh");
    assert!(writer.wal_frame_count() < frames);

    reader.begin_read().unwrap();
    assert!(!reader.snapshot().unwrap().reads_main_file_only());
    assert_eq!(get(&reader, 100), Some(b"fresh".to_vec()));
    assert_eq!(get(&reader, 19), Some(vec![19u8; 40]));
    reader.end_read().unwrap();
}

#[test]
fn test_truncate_leaves_self_contained_main_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
        let table = MemoryLockTable::new();
        let pager = connect(&path, &table, config());
        for rowid in 0..50 {
            put(&pager, rowid, format!("row {rowid}").as_bytes());
        }
        let result = pager.checkpoint(CheckpointMode::Truncate).unwrap();
        assert!(result.is_complete());
        assert_eq!(pager.wal_frame_count(), 0);
    }

    let wal = sidecar_path(&path, "-wal");
    assert_eq!(file_len(&wal), 0);
    std::fs::remove_file(&wal).unwrap();

    let table = MemoryLockTable::new();
    let pager = connect(&path, &table, config());
    pager.begin_read().unwrap();
    for rowid in 0..50 {
        assert_eq!(get(&pager, rowid), Some(format!("row {rowid}").into_bytes()));
    }
    assert_eq!(file_len(&path), pager.db_size() as u64 * 512);
    pager.end_read().unwrap();
}

#[test]
fn test_auto_checkpoint_bounds_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let table = MemoryLockTable::new();
    let pager = connect(&path, &table, config().with_wal_autocheckpoint(5));

    for rowid in 0..40 {
        put(&pager, rowid, b"small");
        assert!(pager.wal_frame_count() <= 5, "log grew to {}", pager.wal_frame_count());
    }
    assert!(file_len(&path) > 0);

    pager.begin_read().unwrap();
    for rowid in 0..40 {
        assert_eq!(get(&pager, rowid), Some(b"small".to_vec()));
    }
    pager.end_read().unwrap();
}

#[test]
fn test_checkpoint_worker_runs_requests() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let table = MemoryLockTable::new();
    let pager = connect(&path, &table, config());
    let worker_conn = Pager::open_with_lock_manager(&path, config(), Box::new(table.connect())).unwrap();
    let worker = CheckpointWorker::new(worker_conn);

    for rowid in 0..10 {
        put(&pager, rowid, b"queued");
    }
    let result = worker.checkpoint_sync(CheckpointMode::Truncate).unwrap();
    assert!(result.is_complete());
    assert_eq!(result.wal_frames, 10);
    assert_eq!(file_len(&sidecar_path(&path, "-wal")), 0);

    // errors come back to a waiting caller
    put(&pager, 10, b"one");
    pager.begin_read().unwrap();
    put(&connect(&path, &table, config()), 11, b"two");
    assert!(matches!(
        worker.checkpoint_sync(CheckpointMode::Full),
        Err(LodeError::Busy)
    ));
    assert_eq!(get(&pager, 11), None);
    pager.end_read().unwrap();

    // queued requests are drained before the worker stops
    worker.schedule(CheckpointMode::Passive).unwrap();
    drop(worker);

    pager.begin_read().unwrap();
    assert!(pager.snapshot().unwrap().reads_main_file_only());
    assert_eq!(get(&pager, 11), Some(b"two".to_vec()));
    pager.end_read().unwrap();
}
