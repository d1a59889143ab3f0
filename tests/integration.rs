//! Marten - Integration Tests
//! End-to-end tests validating the full engine lifecycle:
//! open → set → get → delete → scan → crash recovery → flush →
//! compaction → snapshots.

use std::sync::Arc;

mod common {
    use marten::Config;

    /// Config pointing at a temporary directory, with a tiny memtable
    /// so flushes happen after a handful of writes.
    pub fn temp_config(dir: &std::path::Path) -> Config {
        Config::new(dir)
            .with_memtable_max_size(1024)
            .with_compaction_trigger(3)
    }
}

#[test]
fn test_basic_set_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    engine.set(b"name".to_vec(), b"marten".to_vec()).unwrap();
    engine.set(b"version".to_vec(), b"0.3.0".to_vec()).unwrap();

    assert_eq!(engine.get(b"name").unwrap(), Some(b"marten".to_vec()));
    assert_eq!(engine.get(b"version").unwrap(), Some(b"0.3.0".to_vec()));
    // Absence is a normal outcome, not an error.
    assert_eq!(engine.get(b"missing").unwrap(), None);

    engine.delete(b"name".to_vec()).unwrap();
    assert_eq!(engine.get(b"name").unwrap(), None);
    assert_eq!(engine.get(b"version").unwrap(), Some(b"0.3.0".to_vec()));

    // Deleting an absent key succeeds.
    engine.delete(b"never_existed".to_vec()).unwrap();
}

#[test]
fn test_overwrite_value() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    engine.set(b"key".to_vec(), b"old".to_vec()).unwrap();
    assert_eq!(engine.get(b"key").unwrap(), Some(b"old".to_vec()));

    engine.set(b"key".to_vec(), b"new".to_vec()).unwrap();
    assert_eq!(engine.get(b"key").unwrap(), Some(b"new".to_vec()));

    assert_eq!(engine.scan().unwrap().len(), 1);
}

#[test]
fn test_scan_is_sorted_and_merged() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    // Enough writes to push some keys into segments while others stay
    // in the memtable; insertion order deliberately scrambled.
    for i in (0..100).rev() {
        let key = format!("key_{:03}", i).into_bytes();
        engine.set(key, format!("v{}", i).into_bytes()).unwrap();
    }
    engine.delete(b"key_050".to_vec()).unwrap();

    let entries = engine.scan().unwrap();
    assert_eq!(entries.len(), 99);
    let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "scan output must be key-ordered");
    assert!(!keys.contains(&b"key_050".to_vec()));
}

#[test]
fn test_recovery_from_wal_after_crash() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
        engine.set(b"durable".to_vec(), b"yes".to_vec()).unwrap();
        engine.set(b"count".to_vec(), b"42".to_vec()).unwrap();
        engine.delete(b"durable".to_vec()).unwrap();
        // Simulate a crash: no close(), no flush, just vanish.
        std::mem::forget(engine);
    }

    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"count").unwrap(), Some(b"42".to_vec()));
    assert_eq!(engine.get(b"durable").unwrap(), None);
    assert!(engine.metrics().wal_records_replayed.load(std::sync::atomic::Ordering::Relaxed) >= 3);
}

#[test]
fn test_recovery_after_clean_close() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
        for i in 0..200 {
            let key = format!("key_{:04}", i).into_bytes();
            engine.set(key, vec![b'v'; 16]).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
    // Everything was flushed at close; replay has nothing to do.
    assert_eq!(
        engine
            .metrics()
            .wal_records_replayed
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
    for i in 0..200 {
        let key = format!("key_{:04}", i);
        assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(vec![b'v'; 16]));
    }
}

#[test]
fn test_torn_wal_tail_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
        engine.set(b"intact".to_vec(), b"v".to_vec()).unwrap();
        std::mem::forget(engine);
    }

    // Garbage appended past the last complete record looks exactly like
    // a write torn by power loss.
    let wal_dir = dir.path().join("wal");
    let newest = std::fs::read_dir(&wal_dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext == "wal"))
        .max()
        .unwrap();
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(&newest).unwrap();
    file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();

    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"intact").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_sequence_numbers_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
        engine.set(b"k".to_vec(), b"first".to_vec()).unwrap();
        engine.close().unwrap();
    }
    {
        // A write after restart must shadow the pre-restart one even
        // though the old version now lives in a segment.
        let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
        engine.set(b"k".to_vec(), b"second".to_vec()).unwrap();
        engine.close().unwrap();
    }

    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_forced_compaction_preserves_data() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    for i in 0..300 {
        let key = format!("key_{:04}", i).into_bytes();
        engine.set(key, format!("value_{}", i).into_bytes()).unwrap();
    }
    for i in (0..300).step_by(3) {
        engine.delete(format!("key_{:04}", i).into_bytes()).unwrap();
    }

    engine.force_compact().unwrap();
    assert_eq!(engine.segment_count(), 1);

    assert_eq!(engine.get(b"key_0000").unwrap(), None);
    assert_eq!(
        engine.get(b"key_0001").unwrap(),
        Some(b"value_1".to_vec())
    );
    assert_eq!(engine.scan().unwrap().len(), 200);
}

#[test]
fn test_snapshot_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    engine.set(b"k".to_vec(), b"v1".to_vec()).unwrap();
    engine.set(b"doomed".to_vec(), b"here".to_vec()).unwrap();

    let snapshot = engine.snapshot().unwrap();

    engine.set(b"k".to_vec(), b"v2".to_vec()).unwrap();
    engine.delete(b"doomed".to_vec()).unwrap();
    engine.set(b"later".to_vec(), b"new".to_vec()).unwrap();

    // The snapshot's view is frozen at creation time.
    assert_eq!(snapshot.get(b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(snapshot.get(b"doomed").unwrap(), Some(b"here".to_vec()));
    assert_eq!(snapshot.get(b"later").unwrap(), None);

    // The live view moved on.
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.get(b"doomed").unwrap(), None);
}

#[test]
fn test_snapshot_survives_flush_and_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    engine.set(b"pinned".to_vec(), b"before".to_vec()).unwrap();
    let snapshot = engine.snapshot().unwrap();

    // Churn enough data through the engine to force flushes and a full
    // compaction while the snapshot is open.
    for i in 0..300 {
        let key = format!("churn_{:04}", i).into_bytes();
        engine.set(key, vec![b'x'; 32]).unwrap();
    }
    engine.set(b"pinned".to_vec(), b"after".to_vec()).unwrap();
    engine.delete(b"pinned".to_vec()).unwrap();
    engine.force_compact().unwrap();

    assert_eq!(snapshot.get(b"pinned").unwrap(), Some(b"before".to_vec()));
    assert_eq!(snapshot.get(b"churn_0000").unwrap(), None);
    assert_eq!(engine.get(b"pinned").unwrap(), None);
}

#[test]
fn test_snapshot_retention_cap() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path()).with_snapshot_retention(2);
    let engine = marten::Marten::open(config).unwrap();

    let s1 = engine.snapshot().unwrap();
    let s2 = engine.snapshot().unwrap();
    assert!(engine.snapshot().is_err());

    drop(s1);
    let s3 = engine.snapshot().unwrap();
    drop(s2);
    drop(s3);
}

#[test]
fn test_atomic_update_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(marten::Marten::open(common::temp_config(dir.path())).unwrap());
    engine.set(b"counter".to_vec(), b"0".to_vec()).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                engine
                    .atomic_update(b"counter", |current| {
                        let n: u64 = String::from_utf8(current.unwrap())
                            .unwrap()
                            .parse()
                            .unwrap();
                        Some((n + 1).to_string().into_bytes())
                    })
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.get(b"counter").unwrap(), Some(b"200".to_vec()));
}

#[test]
fn test_concurrent_readers_and_writers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(marten::Marten::open(common::temp_config(dir.path())).unwrap());

    let writer = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for i in 0..500 {
                let key = format!("key_{:04}", i).into_bytes();
                engine.set(key, format!("v{}", i).into_bytes()).unwrap();
            }
        })
    };
    let reader = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for i in 0..500 {
                let key = format!("key_{:04}", i % 50);
                // Readers may or may not see a given key yet; what they
                // must never see is an error or a wrong value.
                if let Some(value) = engine.get(key.as_bytes()).unwrap() {
                    assert_eq!(value, format!("v{}", i % 50).into_bytes());
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    for i in 0..500 {
        let key = format!("key_{:04}", i);
        assert_eq!(
            engine.get(key.as_bytes()).unwrap(),
            Some(format!("v{}", i).into_bytes())
        );
    }
}

#[test]
fn test_tombstone_shadows_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
        engine.set(b"ghost".to_vec(), b"v".to_vec()).unwrap();
        engine.force_compact().unwrap();
        engine.delete(b"ghost".to_vec()).unwrap();
        engine.close().unwrap();
    }

    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"ghost").unwrap(), None);
    assert!(engine.scan().unwrap().is_empty());
}

#[test]
fn test_large_values_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    // Values larger than the whole memtable threshold.
    let big = vec![0xABu8; 8 * 1024];
    engine.set(b"big".to_vec(), big.clone()).unwrap();
    engine.set(b"small".to_vec(), b"s".to_vec()).unwrap();
    engine.close().unwrap();

    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"big").unwrap(), Some(big));
    assert_eq!(engine.get(b"small").unwrap(), Some(b"s".to_vec()));
}

#[test]
fn test_structured_blob_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    // Callers encode structured values to bytes themselves; the engine
    // stores them opaquely.
    let blob = br#"{"name":"Alice","age":30}"#.to_vec();
    engine.set(b"user:1".to_vec(), blob.clone()).unwrap();
    assert_eq!(engine.get(b"user:1").unwrap(), Some(blob));

    engine.delete(b"user:1".to_vec()).unwrap();
    assert_eq!(engine.get(b"user:1").unwrap(), None);
}

#[test]
fn test_greeting_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    engine
        .set(b"greeting".to_vec(), b"Hello, World!".to_vec())
        .unwrap();
    assert_eq!(
        engine.get(b"greeting").unwrap(),
        Some(b"Hello, World!".to_vec())
    );

    engine.delete(b"greeting".to_vec()).unwrap();
    // Absent after delete, never an error carrying stale data.
    assert_eq!(engine.get(b"greeting").unwrap(), None);
}

#[test]
fn test_bulk_writes_then_forced_compaction() {
    let dir = tempfile::tempdir().unwrap();
    // Compaction trigger set high so only the forced pass merges.
    let config = marten::Config::new(dir.path())
        .with_memtable_max_size(64 * 1024)
        .with_compaction_trigger(64)
        .with_wal_sync(marten::WalSyncMode::Periodic);
    let engine = marten::Marten::open(config).unwrap();

    for i in 0..10_000u32 {
        let key = format!("key_{:06}", i).into_bytes();
        let value = format!("value_{:06}", i).into_bytes();
        engine.set(key, value).unwrap();
    }
    engine.flush().unwrap();
    let before = engine.segment_count();
    assert!(before > 1);

    engine.force_compact().unwrap();
    assert!(engine.segment_count() < before);

    for i in (0..10_000u32).step_by(613) {
        let key = format!("key_{:06}", i);
        assert_eq!(
            engine.get(key.as_bytes()).unwrap(),
            Some(format!("value_{:06}", i).into_bytes())
        );
    }
    assert_eq!(engine.scan().unwrap().len(), 10_000);
}

#[test]
fn test_close_is_idempotent_and_final() {
    let dir = tempfile::tempdir().unwrap();
    let engine = marten::Marten::open(common::temp_config(dir.path())).unwrap();

    engine.set(b"k".to_vec(), b"v".to_vec()).unwrap();
    engine.close().unwrap();
    engine.close().unwrap();

    assert!(matches!(
        engine.set(b"k2".to_vec(), b"v".to_vec()),
        Err(marten::MartenError::Closed)
    ));
    assert!(matches!(
        engine.delete(b"k".to_vec()),
        Err(marten::MartenError::Closed)
    ));
}
