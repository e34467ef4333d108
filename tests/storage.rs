//! Storage backend tests.

mod common;

use common::{log_store, stores};
use linemq::core::config::{StorageBackend, StorageConfig};
use linemq::storage::{self, CompactionPolicy, KvStore, LogStore, LogStoreOptions, WriteBatch};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

fn segment_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "wal"))
        .collect();
    files.sort();
    files
}

fn keys_of(records: &[(Vec<u8>, Vec<u8>)]) -> Vec<&[u8]> {
    records.iter().map(|(k, _)| k.as_slice()).collect()
}

// ============================================================================
// Contract, on both backends
// ============================================================================

#[test]
fn point_operations() {
    let dir = tempfile::tempdir().unwrap();
    for store in stores(&dir) {
        assert_eq!(store.get(b"missing").unwrap(), None);

        store.put(b"a", b"1").unwrap();
        store.put(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));

        store.delete(b"a").unwrap();
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None, "backend {}", store.backend());
    }
}

#[test]
fn prefix_scans_are_ordered_and_bounded() {
    let dir = tempfile::tempdir().unwrap();
    for store in stores(&dir) {
        for key in [&b"m/foo/\x02"[..], b"m/foo/\x01", b"m/fop", b"m/fo", b"l/foo/x"] {
            store.put(key, b"v").unwrap();
        }

        let scanned = store.scan_prefix(b"m/foo/").unwrap();
        assert_eq!(keys_of(&scanned), vec![&b"m/foo/\x01"[..], b"m/foo/\x02"]);

        let last = store.last_with_prefix(b"m/foo/").unwrap();
        assert_eq!(last.map(|(k, _)| k), Some(b"m/foo/\x02".to_vec()));
        assert_eq!(store.last_with_prefix(b"m/bar/").unwrap(), None);
        assert_eq!(store.scan_prefix(b"").unwrap().len(), 5);
    }
}

#[test]
fn prefix_scan_handles_max_bytes() {
    let dir = tempfile::tempdir().unwrap();
    for store in stores(&dir) {
        store.put(&[0xff, 0xff], b"edge").unwrap();
        store.put(&[0xff, 0xff, 0x00], b"inside").unwrap();
        store.put(&[0xfe], b"outside").unwrap();

        let scanned = store.scan_prefix(&[0xff]).unwrap();
        assert_eq!(scanned.len(), 2);
        let last = store.last_with_prefix(&[0xff, 0xff]).unwrap();
        assert_eq!(last.map(|(_, v)| v), Some(b"inside".to_vec()));
    }
}

#[test]
fn batches_apply_in_order() {
    let dir = tempfile::tempdir().unwrap();
    for store in stores(&dir) {
        store.put(b"gone", b"x").unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put(b"k".to_vec(), b"1".to_vec())
            .put(b"k".to_vec(), b"2".to_vec())
            .delete(b"gone".to_vec())
            .put(b"other".to_vec(), b"3".to_vec());
        assert_eq!(batch.len(), 4);
        store.write(batch).unwrap();

        assert_eq!(store.get(b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.get(b"other").unwrap(), Some(b"3".to_vec()));

        store.write(WriteBatch::new()).unwrap();
    }
}

#[test]
fn closed_store_rejects_operations() {
    let dir = tempfile::tempdir().unwrap();
    for store in stores(&dir) {
        store.put(b"k", b"v").unwrap();
        store.close().unwrap();
        store.close().unwrap();

        assert!(store.get(b"k").is_err());
        assert!(store.put(b"k", b"v").is_err());
        assert!(store.scan_prefix(b"").is_err());
        assert!(store.write(WriteBatch::new()).is_err());
        assert!(store.sync().is_err());
    }
}

#[test]
fn open_selects_backend() {
    let dir = tempfile::tempdir().unwrap();
    let memory = storage::open(&StorageConfig::memory()).unwrap();
    assert_eq!(memory.backend(), StorageBackend::Memory);

    let nested = dir.path().join("a").join("b");
    let durable = storage::open(&StorageConfig::durable(
        nested.to_string_lossy().to_string(),
    ))
    .unwrap();
    assert_eq!(durable.backend(), StorageBackend::Durable);
    assert!(nested.is_dir());
}

// ============================================================================
// Durable store recovery
// ============================================================================

#[test]
fn durable_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = log_store(dir.path());
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.delete(b"a").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"c".to_vec(), b"3".to_vec());
        store.write(batch).unwrap();
        store.close().unwrap();
    }

    let store = log_store(dir.path());
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.get(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(store.stats().keys, 2);

    store.put(b"d", b"4").unwrap();
    store.close().unwrap();
    let store = log_store(dir.path());
    assert_eq!(store.scan_prefix(b"").unwrap().len(), 3);
}

#[test]
fn torn_tail_is_truncated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = log_store(dir.path());
        for key in [b"a", b"b", b"c"] {
            store.put(key, b"value").unwrap();
        }
        store.close().unwrap();
    }

    let segment = segment_files(dir.path()).pop().unwrap();
    let intact_len = std::fs::metadata(&segment).unwrap().len();
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&segment)
            .unwrap();
        // Length prefix promising 64 bytes, followed by only two.
        file.write_all(&[64, 0, 0, 0, 0xde, 0xad]).unwrap();
    }

    let store = log_store(dir.path());
    assert_eq!(store.scan_prefix(b"").unwrap().len(), 3);
    assert_eq!(std::fs::metadata(&segment).unwrap().len(), intact_len);

    store.put(b"d", b"value").unwrap();
    store.close().unwrap();
    let store = log_store(dir.path());
    assert_eq!(store.scan_prefix(b"").unwrap().len(), 4);
}

#[test]
fn undecodable_record_ends_replay() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = log_store(dir.path());
        store.put(b"kept", b"value").unwrap();
        store.close().unwrap();
    }

    let segment = segment_files(dir.path()).pop().unwrap();
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&segment)
            .unwrap();
        file.write_all(&[3, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let store = log_store(dir.path());
    assert_eq!(store.get(b"kept").unwrap(), Some(b"value".to_vec()));
    assert_eq!(store.stats().keys, 1);
}

#[test]
fn segments_rotate_and_replay_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let options = LogStoreOptions {
        strict: false,
        segment_max_bytes: 256,
        compaction: CompactionPolicy::disabled(),
    };
    {
        let store = LogStore::open(dir.path().to_path_buf(), options.clone()).unwrap();
        for i in 0..50u32 {
            store.put(format!("key-{:02}", i).as_bytes(), &[b'x'; 32]).unwrap();
        }
        store.put(b"key-00", b"latest").unwrap();
        assert!(store.stats().segments > 1);
        store.close().unwrap();
    }
    assert!(segment_files(dir.path()).len() > 1);

    let store = LogStore::open(dir.path().to_path_buf(), options).unwrap();
    assert_eq!(store.stats().keys, 50);
    assert_eq!(store.get(b"key-00").unwrap(), Some(b"latest".to_vec()));
}

// ============================================================================
// Compaction
// ============================================================================

#[test]
fn sync_compacts_when_garbage_dominates() {
    let dir = tempfile::tempdir().unwrap();
    let options = LogStoreOptions {
        strict: false,
        segment_max_bytes: 512,
        compaction: CompactionPolicy {
            min_log_bytes: 0,
            garbage_ratio: 0.5,
            enabled: true,
        },
    };
    {
        let store = LogStore::open(dir.path().to_path_buf(), options.clone()).unwrap();
        for i in 0..100u32 {
            store.put(b"hot", format!("v{}", i).as_bytes()).unwrap();
        }
        store.put(b"cold", b"stable").unwrap();

        let before = store.stats();
        assert!(before.segments > 1);
        assert!(before.garbage_ratio() > 0.5);

        store.sync().unwrap();
        let after = store.stats();
        assert_eq!(after.segments, 1);
        assert!(after.log_bytes < before.log_bytes);
        assert_eq!(after.keys, 2);
        store.close().unwrap();
    }
    assert_eq!(segment_files(dir.path()).len(), 1);

    let store = LogStore::open(dir.path().to_path_buf(), options).unwrap();
    assert_eq!(store.get(b"hot").unwrap(), Some(b"v99".to_vec()));
    assert_eq!(store.get(b"cold").unwrap(), Some(b"stable".to_vec()));
}

#[test]
fn disabled_policy_never_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = log_store(dir.path());
    for i in 0..100u32 {
        store.put(b"hot", format!("v{}", i).as_bytes()).unwrap();
    }
    let before = store.stats();
    store.sync().unwrap();
    assert_eq!(store.stats().log_bytes, before.log_bytes);

    store.compact().unwrap();
    assert!(store.stats().log_bytes < before.log_bytes);
    assert_eq!(store.get(b"hot").unwrap(), Some(b"v99".to_vec()));
}

#[test]
fn writes_after_compaction_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = log_store(dir.path());
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"1").unwrap();
        store.compact().unwrap();

        store.put(b"a", b"2").unwrap();
        store.delete(b"b").unwrap();
        store.compact().unwrap();

        store.put(b"c", b"3").unwrap();
        store.close().unwrap();
    }
    assert_eq!(segment_files(dir.path()).len(), 2);

    let store = log_store(dir.path());
    assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), None);
    assert_eq!(store.get(b"c").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn compaction_runs_alongside_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = log_store(dir.path());

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..200u32 {
                store
                    .put(format!("k{:03}", i).as_bytes(), &i.to_le_bytes())
                    .unwrap();
                store.put(b"hot", &i.to_le_bytes()).unwrap();
            }
        })
    };
    for _ in 0..20 {
        store.compact().unwrap();
    }
    writer.join().unwrap();

    assert_eq!(store.scan_prefix(b"k").unwrap().len(), 200);
    store.compact().unwrap();
    assert_eq!(store.stats().segments, 1);
    store.close().unwrap();
    drop(store);

    let store = log_store(dir.path());
    assert_eq!(store.scan_prefix(b"k").unwrap().len(), 200);
    assert_eq!(
        store.get(b"k123").unwrap(),
        Some(123u32.to_le_bytes().to_vec())
    );
    assert_eq!(
        store.get(b"hot").unwrap(),
        Some(199u32.to_le_bytes().to_vec())
    );
}
