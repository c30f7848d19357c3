//! CELLAR - Integration Tests
//! End-to-end tests through the public facade:
//! create → set → get → compare-and-set → enumerate → backup → reopen.

use std::thread;
use std::time::Duration;

use cellar::engine::ttl::{derive_ttl, expires_at};
use cellar::{
    create_database, database_exists, open_database, DbAction, Engine, EngineError, EngineOptions,
    LogEngine, Storage, StorageConfig, StorageError,
};

mod common {
    use cellar::{EngineOptions, LogEngine, Storage, StorageConfig};

    /// Config pointing at `<dir>/db`, with unsynced writes for speed.
    pub fn temp_config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig::new(dir.join("db")).with_options(|o| o.with_sync_writes(false))
    }

    pub fn memory_storage() -> Storage<LogEngine> {
        let config = StorageConfig::new("unused").with_options(|_| EngineOptions::in_memory());
        Storage::new("memory", &config).unwrap()
    }
}

#[test]
fn test_set_get_compare_and_set_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new("scenario", &common::temp_config(dir.path())).unwrap();

    storage.set_raw(b"", b"k", b"v1", 0).unwrap();
    let entry = storage.get_raw(b"", b"k", false).unwrap().unwrap();
    assert_eq!((entry.value.as_slice(), entry.ttl, entry.version), (&b"v1"[..], 0, 1));

    assert!(storage.compare_and_set_raw(b"", b"k", b"v2", 0, 1).unwrap());
    let entry = storage.get_raw(b"", b"k", false).unwrap().unwrap();
    assert_eq!((entry.value.as_slice(), entry.ttl, entry.version), (&b"v2"[..], 0, 2));

    assert!(!storage.compare_and_set_raw(b"", b"k", b"v3", 0, 1).unwrap());
    let entry = storage.get_raw(b"", b"k", false).unwrap().unwrap();
    assert_eq!(entry.value, b"v2".to_vec());
    assert_eq!(entry.version, 2);
}

#[test]
fn test_versions_strictly_increase() {
    let storage = common::memory_storage();
    assert_eq!(storage.get_raw(b"", b"fresh", false).unwrap(), None);

    let mut last = 0;
    for i in 0..20 {
        storage.set_raw(b"", b"k", format!("v{}", i).as_bytes(), 0).unwrap();
        // Unrelated writes advance the global counter too.
        storage.set_raw(b"", b"other", b"x", 0).unwrap();
        let version = storage.get_raw(b"", b"k", true).unwrap().unwrap().version;
        assert!(version > last, "version {} did not exceed {}", version, last);
        last = version;
    }
}

#[test]
fn test_compare_and_set_only_on_matching_version() {
    let storage = common::memory_storage();
    storage.set_raw(b"", b"k", b"base", 0).unwrap();
    let current = storage.get_raw(b"", b"k", true).unwrap().unwrap().version;

    for wrong in [0, current - 1, current + 1, 999] {
        assert!(!storage.compare_and_set_raw(b"", b"k", b"bad", 0, wrong).unwrap());
        let entry = storage.get_raw(b"", b"k", true).unwrap().unwrap();
        assert_eq!(entry.value, b"base".to_vec());
        assert_eq!(entry.version, current);
    }
    assert!(storage.compare_and_set_raw(b"", b"k", b"good", 0, current).unwrap());
    assert_eq!(storage.get().by_key("k").to_text().unwrap().as_deref(), Some("good"));
}

#[test]
fn test_ttl_reporting() {
    let storage = common::memory_storage();
    storage.set_raw(b"", b"short", b"v", 5).unwrap();
    let ttl = storage.get_raw(b"", b"short", true).unwrap().unwrap().ttl;
    assert!((1..=5).contains(&ttl), "ttl {} out of range", ttl);

    storage.set_raw(b"", b"forever", b"v", 0).unwrap();
    assert_eq!(storage.get_raw(b"", b"forever", true).unwrap().unwrap().ttl, 0);

    // The boundary second reports -1 rather than "no expiry".
    let deadline = expires_at(5, 1_000);
    assert_eq!(derive_ttl(deadline, deadline), -1);
}

#[test]
fn test_expired_entries_disappear() {
    let storage = common::memory_storage();
    storage.set_raw(b"t:", b"gone", b"v", 1).unwrap();
    storage.set_raw(b"t:", b"kept", b"v", 0).unwrap();

    thread::sleep(Duration::from_millis(2100));

    assert_eq!(storage.get_raw(b"t:", b"gone", false).unwrap(), None);
    assert_eq!(storage.fetch_keys_raw(b"t:", 0).unwrap(), vec![b"t:kept".to_vec()]);
}

#[test]
fn test_stored_entry_reports_boundary_second() {
    let storage = common::memory_storage();
    storage.set_raw(b"", b"edge", b"v", 1).unwrap();

    let mut trace = Vec::new();
    for _ in 0..100 {
        match storage.get_raw(b"", b"edge", false).unwrap() {
            Some(entry) => trace.push(Some(entry.ttl)),
            None => {
                trace.push(None);
                break;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(trace.last(), Some(&None), "entry never expired: {:?}", trace);
    assert!(trace.contains(&Some(-1)), "boundary second not observed: {:?}", trace);
    assert!(!trace.contains(&Some(0)), "expiring entry reported no ttl: {:?}", trace);
    assert!(trace.iter().flatten().all(|ttl| *ttl == 1 || *ttl == -1));
}

#[test]
fn test_absent_key_reads() {
    let storage = common::memory_storage();
    assert_eq!(storage.get_raw(b"", b"never", false).unwrap(), None);
    let err = storage.get_raw(b"", b"never", true).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "item not exist: never");
}

#[test]
fn test_atomic_update_abort_leaves_state() {
    let storage = common::memory_storage();
    storage.set_raw(b"", b"k", b"original", 30).unwrap();
    let before = storage.get_raw(b"", b"k", true).unwrap().unwrap();

    let err = storage
        .atomic_update_raw(b"", b"k", |entry| {
            entry.value = b"mutated".to_vec();
            entry.ttl = 0;
            false
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::Canceled));

    let after = storage.get_raw(b"", b"k", true).unwrap().unwrap();
    assert_eq!(after.value, before.value);
    assert_eq!(after.version, before.version);
    assert!(after.ttl > 0);
    assert_eq!(storage.engine().last_version(), 1);
}

#[test]
fn test_enumeration_order_and_early_stop() {
    let storage = common::memory_storage();
    for key in ["a1", "a3", "a2"] {
        storage.set_raw(b"", key.as_bytes(), b"v", 0).unwrap();
    }

    let mut seen = Vec::new();
    storage
        .enumerate_raw(b"a", b"", 0, false, |entry| {
            seen.push(entry.key.clone());
            true
        })
        .unwrap();
    assert_eq!(seen, vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]);

    let mut visits = 0;
    storage
        .enumerate_raw(b"a", b"", 0, false, |_| {
            visits += 1;
            false
        })
        .unwrap();
    assert_eq!(visits, 1);
}

#[test]
fn test_prefix_isolation() {
    let storage = common::memory_storage();
    for suffix in ["1", "2", "3"] {
        storage.set_raw(b"x", suffix.as_bytes(), b"from-x", 0).unwrap();
        storage.set_raw(b"y", suffix.as_bytes(), b"from-y", 0).unwrap();
    }

    let entries = storage.enumerate().with_prefix("x").to_vec().unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.key.starts_with(b"x") && e.value == b"from-x"));

    let keys = storage.fetch_keys_raw(b"y", 1).unwrap();
    assert_eq!(keys, vec![b"y1".to_vec(), b"y2".to_vec(), b"y3".to_vec()]);
}

#[test]
fn test_large_enumeration_pages() {
    let storage = common::memory_storage();
    for i in 0..1_000 {
        storage.set_raw(b"n:", format!("{:05}", i).as_bytes(), b"v", 0).unwrap();
    }
    let keys = storage.enumerate().with_prefix("n:").with_batch_size(7).keys().unwrap();
    assert_eq!(keys.len(), 1_000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let tail = storage.enumerate().with_prefix("n:").with_seek("n:00995").keys().unwrap();
    assert_eq!(tail.len(), 5);
}

#[test]
fn test_no_transaction_leaks() {
    let storage = common::memory_storage();
    for i in 0..2_000u32 {
        let key = format!("k{}", i % 50);
        storage.set_raw(b"", key.as_bytes(), &i.to_be_bytes(), 0).unwrap();
        storage.get_raw(b"", key.as_bytes(), false).unwrap();
        storage.compare_and_set_raw(b"", key.as_bytes(), b"x", 0, 12345).unwrap();
        let _ = storage.atomic_update_raw(b"", key.as_bytes(), |_| i % 2 == 0);
        storage.get_raw(b"", b"missing", true).unwrap_err();
    }
    storage.enumerate().for_each(|_| false).unwrap();
    storage.remove_raw(b"", b"k0").unwrap();
    assert_eq!(storage.engine().open_transactions(), 0);
}

#[test]
fn test_concurrent_increments_with_retry() {
    let storage = common::memory_storage();
    let threads = 4;
    let per_thread = 50;

    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                for _ in 0..per_thread {
                    loop {
                        match storage.increment().by_key("counter").execute() {
                            Ok(_) => break,
                            Err(err) if err.is_conflict() => continue,
                            Err(err) => panic!("unexpected error: {}", err),
                        }
                    }
                }
            });
        }
    });

    assert_eq!(
        storage.get().by_key("counter").to_counter().unwrap(),
        Some((threads * per_thread) as u64)
    );
    assert_eq!(storage.engine().open_transactions(), 0);
}

#[test]
fn test_concurrent_compare_and_set_single_winner() {
    let storage = common::memory_storage();
    storage.set_raw(b"", b"slot", b"initial", 0).unwrap();

    let winners: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let storage = &storage;
                scope.spawn(move || {
                    match storage.compare_and_set_raw(b"", b"slot", format!("w{}", i).as_bytes(), 0, 1) {
                        Ok(applied) => applied as usize,
                        Err(err) if err.is_conflict() => 0,
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(winners, 1);
    assert_eq!(storage.get_raw(b"", b"slot", true).unwrap().unwrap().version, 2);
}

#[test]
fn test_reopen_preserves_data_and_versions() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    {
        let storage = Storage::new("durable", &config).unwrap();
        storage.set_raw(b"", b"a", b"1", 0).unwrap();
        storage.set_raw(b"", b"b", b"2", 3600).unwrap();
        storage.remove_raw(b"", b"a").unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::new("durable", &config).unwrap();
    assert_eq!(storage.get_raw(b"", b"a", false).unwrap(), None);
    let b = storage.get_raw(b"", b"b", true).unwrap().unwrap();
    assert_eq!(b.version, 2);
    assert!(b.ttl > 3500);

    storage.set_raw(b"", b"c", b"3", 0).unwrap();
    assert_eq!(storage.get_raw(b"", b"c", true).unwrap().unwrap().version, 4);
}

#[test]
fn test_lifecycle_actions() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    assert!(!database_exists(&config.data_dir));

    let strict = config.clone().with_action(DbAction::FailIfNotExist);
    assert!(matches!(Storage::new("s", &strict), Err(StorageError::DatabaseNotExist(_))));

    create_database(&config).unwrap();
    assert!(database_exists(&config.data_dir));
    assert!(matches!(create_database(&config), Err(StorageError::DatabaseExist(_))));

    let engine = open_database(&strict).unwrap();
    engine.close().unwrap();

    let bad_key = config.clone().with_options(|o| o.with_encryption_key(vec![0u8; 8]));
    assert!(matches!(
        Storage::new("s", &bad_key),
        Err(StorageError::InvalidKeySize { expected: 32, actual: 8 })
    ));
}

#[test]
fn test_encryption_at_rest() {
    let dir = tempfile::tempdir().unwrap();
    let key = vec![9u8; 32];
    let config = common::temp_config(dir.path()).with_options(|o| o.with_encryption_key(key.clone()));
    {
        let storage = Storage::new("secure", &config).unwrap();
        storage.set_raw(b"", b"secret", b"plaintext-marker", 0).unwrap();
        storage.close().unwrap();
    }

    for entry in std::fs::read_dir(config.value_dir()).unwrap() {
        let bytes = std::fs::read(entry.unwrap().path()).unwrap();
        assert!(!bytes.windows(16).any(|w| w == b"plaintext-marker"));
    }

    let storage = Storage::new("secure", &config).unwrap();
    assert_eq!(storage.get().by_key("secret").to_text().unwrap().as_deref(), Some("plaintext-marker"));
    storage.close().unwrap();
    drop(storage);

    let wrong = common::temp_config(dir.path()).with_options(|o| o.with_encryption_key(vec![1u8; 32]));
    assert!(matches!(
        Storage::new("secure", &wrong),
        Err(StorageError::Engine { source: EngineError::Encryption(_), .. })
    ));
}

#[test]
fn test_backup_and_incremental_restore() {
    let source = common::memory_storage();
    source.set_raw(b"", b"a", b"1", 0).unwrap();
    source.set_raw(b"", b"b", b"2", 0).unwrap();

    let mut full = Vec::new();
    let since = source.backup(&mut full, 0).unwrap();
    assert_eq!(since, 3);

    source.set_raw(b"", b"c", b"3", 0).unwrap();
    source.remove_raw(b"", b"a").unwrap();
    let mut delta = Vec::new();
    let next = source.backup(&mut delta, since).unwrap();
    assert_eq!(next, 5);

    let mut empty = Vec::new();
    assert_eq!(source.backup(&mut empty, next).unwrap(), next);

    let target = common::memory_storage();
    target.restore(&mut full.as_slice()).unwrap();
    target.restore(&mut delta.as_slice()).unwrap();

    assert_eq!(target.get_raw(b"", b"a", false).unwrap(), None);
    assert_eq!(target.get_raw(b"", b"b", true).unwrap().unwrap().version, 2);
    assert_eq!(target.get_raw(b"", b"c", true).unwrap().unwrap().version, 3);
}

#[test]
fn test_incremental_backup_carries_expiry() {
    let source = common::memory_storage();
    source.set_raw(b"", b"k", b"stale", 0).unwrap();
    let mut full = Vec::new();
    let since = source.backup(&mut full, 0).unwrap();

    source.set_raw(b"", b"k", b"short-lived", 1).unwrap();
    thread::sleep(Duration::from_millis(2100));
    assert_eq!(source.get_raw(b"", b"k", false).unwrap(), None);

    let mut delta = Vec::new();
    assert_eq!(source.backup(&mut delta, since).unwrap(), since + 1);

    let target = common::memory_storage();
    target.restore(&mut full.as_slice()).unwrap();
    target.restore(&mut delta.as_slice()).unwrap();
    assert_eq!(target.get_raw(b"", b"k", false).unwrap(), None);
    assert!(target.fetch_keys_raw(b"", 0).unwrap().is_empty());
}

#[test]
fn test_restore_rejects_garbage() {
    let storage = common::memory_storage();
    let err = storage.restore(&mut &b"not a backup stream"[..]).unwrap_err();
    assert!(matches!(err, StorageError::Engine { source: EngineError::Corruption(_), .. }));
}

#[test]
fn test_compaction_reclaims_space() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path()).with_options(|o| o.with_value_log_max_entries(10));
    let storage = Storage::new("compact", &config).unwrap();

    for round in 0..5 {
        for i in 0..10 {
            storage
                .set_raw(b"", format!("k{}", i).as_bytes(), format!("r{}", round).as_bytes(), 0)
                .unwrap();
        }
    }
    let before = storage.engine().segment_count();

    let mut rounds = 0;
    while storage.compact(0.5).unwrap() {
        rounds += 1;
    }
    assert!(rounds > 0);
    assert!(storage.engine().segment_count() < before);
    assert!(matches!(storage.compact(1.5), Err(StorageError::Config(_))));

    storage.close().unwrap();
    drop(storage);
    let storage = Storage::new("compact", &config).unwrap();
    for i in 0..10 {
        assert_eq!(
            storage.get_raw(b"", format!("k{}", i).as_bytes(), true).unwrap().unwrap().value,
            b"r4".to_vec()
        );
    }
}

#[test]
fn test_drop_prefix_and_drop_all() {
    let storage = common::memory_storage();
    for key in ["user:1", "user:2", "item:1"] {
        storage.set_raw(b"", key.as_bytes(), b"v", 0).unwrap();
    }

    storage.drop_with_prefix(b"user:").unwrap();
    assert!(storage.fetch_keys_raw(b"user:", 0).unwrap().is_empty());
    assert_eq!(storage.fetch_keys_raw(b"", 0).unwrap(), vec![b"item:1".to_vec()]);

    storage.drop_all().unwrap();
    assert!(storage.fetch_keys_raw(b"", 0).unwrap().is_empty());
    storage.set_raw(b"", b"after", b"v", 0).unwrap();
    assert!(storage.get_raw(b"", b"after", true).unwrap().is_some());
}

#[test]
fn test_read_only_storage() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    {
        let storage = Storage::new("rw", &config).unwrap();
        storage.set_raw(b"", b"k", b"v", 0).unwrap();
        storage.close().unwrap();
    }

    let read_only = config.with_options(EngineOptions::with_read_only);
    let storage = Storage::new("ro", &read_only).unwrap();
    assert_eq!(storage.get().by_key("k").to_text().unwrap().as_deref(), Some("v"));
    assert!(matches!(
        storage.set_raw(b"", b"k", b"other", 0),
        Err(StorageError::Engine { source: EngineError::ReadOnly, .. })
    ));
}

#[test]
fn test_storage_over_explicit_engine() {
    let engine = LogEngine::open(EngineOptions::in_memory().with_detect_conflicts(false)).unwrap();
    let storage = Storage::from_engine("explicit", engine).with_max_pending_writes(1);
    storage.set().with_prefix("p:").by_key("k").with_value("v").with_ttl(60).execute().unwrap();
    let entry = storage.get().with_prefix("p:").by_key("k").required().to_entry().unwrap().unwrap();
    assert_eq!(entry.key, b"p:k".to_vec());
    assert!(entry.ttl > 0);
    assert_eq!(storage.name(), "explicit");
}
