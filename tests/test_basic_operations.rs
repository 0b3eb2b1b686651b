use lumosync::{
    Database, DbFlags, EnvFlags, Environment, Error, TransactionFlags, TxnState, WriteFlags,
    MAX_VAL_SIZE,
};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::builder()
        .set_max_dbs(4)
        .open(temp_dir.path())
        .unwrap();
    (temp_dir, env)
}

#[test]
fn test_database_open() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();

    // Test opening default database
    let root = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(root.dbi(), 0);

    // Missing named databases need CREATE
    let missing = Database::open(&mut txn, Some("testdb"), DbFlags::empty());
    assert!(matches!(missing, Err(Error::NotFound)));

    let db = Database::open(&mut txn, Some("testdb"), DbFlags::CREATE).unwrap();
    assert_ne!(db, root);
    txn.commit().unwrap();

    // Reopening returns the same handle
    let mut txn = env.begin_ro_txn().unwrap();
    let again = Database::open(&mut txn, Some("testdb"), DbFlags::empty()).unwrap();
    assert_eq!(again, db);
}

#[test]
fn test_max_dbs() {
    let dir = TempDir::new().unwrap();
    let env = Environment::builder().set_max_dbs(1).open(dir.path()).unwrap();
    let mut txn = env.begin_rw_txn().unwrap();

    txn.open_db(Some("one"), DbFlags::CREATE).unwrap();
    let result = txn.open_db(Some("two"), DbFlags::CREATE);
    assert!(matches!(result, Err(Error::DbsFull)));
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    let result = db.get(&txn, key).unwrap();

    assert_eq!(result, value);
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    assert!(db.get(&txn, key).is_ok());

    db.del(&mut txn, key).unwrap();
    assert!(db.get(&txn, key).unwrap_err().is_not_found());
    assert!(matches!(db.del(&mut txn, key), Err(Error::NotFound)));
}

#[test]
fn test_database_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Get initial stats
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);

    // Add some entries and check stats
    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        db.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    txn.commit().unwrap();

    assert_eq!(env.stat().unwrap().entries, 5);
}

#[test]
fn test_drop_database() {
    let (_dir, env) = setup_test_env();
    env.update(|txn| {
        let db = txn.open_db(Some("scratch"), DbFlags::CREATE)?;
        txn.put(&db, b"k", b"v", WriteFlags::empty())?;
        Ok(())
    })
    .unwrap();

    env.update(|txn| {
        let db = txn.open_db(Some("scratch"), DbFlags::empty())?;
        db.drop(txn, false)?;
        assert_eq!(db.stat(txn)?.entries, 0);
        db.drop(txn, true)
    })
    .unwrap();

    let mut txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        txn.open_db(Some("scratch"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Test key not found
    let result = db.get(&txn, b"nonexistent_key");
    assert!(matches!(result, Err(Error::NotFound)));

    // Test duplicate key with NOOVERWRITE flag
    let key = b"unique_key";
    let value1 = b"value1";
    let value2 = b"value2";

    db.put(&mut txn, key, value1, WriteFlags::empty()).unwrap();
    let result = db.put(&mut txn, key, value2, WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));

    // Empty keys are rejected
    let result = db.put(&mut txn, b"", value1, WriteFlags::empty());
    assert!(matches!(result, Err(Error::BadValSize)));

    // So are keys over the maximum size
    let long_key = vec![b'k'; env.max_key_size() + 1];
    let result = db.put(&mut txn, &long_key, value1, WriteFlags::empty());
    assert!(matches!(result, Err(Error::BadValSize)));
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_oversized_value_rejected() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();

    // Zeroed allocations are not touched until written, and put checks the
    // length before copying
    let value = vec![0u8; MAX_VAL_SIZE + 1];
    let result = txn.put(&db, b"key", &value, WriteFlags::empty());
    assert!(matches!(result, Err(Error::BadValSize)));
    drop(value);

    txn.put(&db, b"key", b"small", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_readonly_rejects_writes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();

    assert!(txn.is_readonly());
    let result = txn.put(&db, b"key", b"value", WriteFlags::empty());
    assert!(matches!(result, Err(Error::TxnReadOnly)));
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    // Write transaction
    let mut write_txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut write_txn, None, DbFlags::empty()).unwrap();
    db.put(&mut write_txn, b"key", b"value", WriteFlags::empty())
        .unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.begin_ro_txn().unwrap();
    assert!(db.get(&read_txn, b"key").unwrap_err().is_not_found());

    // After commit, changes should be visible to new readers only
    write_txn.commit().unwrap();
    assert!(db.get(&read_txn, b"key").unwrap_err().is_not_found());

    let read_txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&read_txn, b"key").unwrap(), b"value");
}

#[test]
fn test_transaction_ids() {
    let (_dir, env) = setup_test_env();
    assert_eq!(env.begin_ro_txn().unwrap().id(), 0);

    let writer = env.begin_rw_txn().unwrap();
    assert_eq!(writer.id(), 1);
    writer.commit().unwrap();

    assert_eq!(env.begin_ro_txn().unwrap().id(), 1);
    assert_eq!(env.info().unwrap().last_txn_id, 1);
}

#[test]
fn test_reset_renew() {
    let (_dir, env) = setup_test_env();
    let mut reader = env.begin_ro_txn().unwrap();
    let db = reader.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(reader.state(), TxnState::Active);

    // Renewing an active reader is an error
    assert!(matches!(reader.renew(), Err(Error::BadTxn)));

    reader.reset().unwrap();
    assert_eq!(reader.state(), TxnState::Reset);
    assert!(matches!(reader.get(&db, b"key"), Err(Error::BadTxn)));
    assert_eq!(env.reader_list().len(), 1);

    env.update(|txn| txn.put(&db, b"key", b"value", WriteFlags::empty()))
        .unwrap();

    reader.renew().unwrap();
    assert_eq!(reader.state(), TxnState::Active);
    assert_eq!(reader.id(), 1);
    assert_eq!(reader.get(&db, b"key").unwrap(), b"value");

    // Writers cannot be reset
    drop(reader);
    let mut writer = env.begin_rw_txn().unwrap();
    assert!(matches!(writer.reset(), Err(Error::BadTxn)));
}

#[test]
fn test_drop_aborts() {
    let (_dir, env) = setup_test_env();
    {
        let mut txn = env.begin_rw_txn().unwrap();
        let db = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(&db, b"key", b"value", WriteFlags::empty()).unwrap();
    }
    {
        let _reader = env.begin_ro_txn().unwrap();
        assert_eq!(env.info().unwrap().num_readers, 1);
    }
    assert_eq!(env.info().unwrap().num_readers, 0);

    // The writer lock was released by the drop
    let txn = env.begin_rw_txn().unwrap();
    assert_eq!(txn.id(), 1);
    txn.abort();
    assert_eq!(env.stat().unwrap().entries, 0);
}

#[test]
fn test_failed_commit_releases_writer() {
    let dir = TempDir::new().unwrap();
    let env = Environment::builder()
        .set_map_size(2 * 4096)
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(&db, b"big", &[7u8; 8192], WriteFlags::empty()).unwrap();
    assert!(matches!(txn.commit(), Err(Error::MapFull)));

    // Nothing was published and the next writer starts from the last commit
    let mut txn = env.begin_rw_txn().unwrap();
    assert_eq!(txn.id(), 1);
    txn.put(&db, b"small", b"fits", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.id(), 1);
    assert!(txn.get(&db, b"big").unwrap_err().is_not_found());
    assert_eq!(txn.get(&db, b"small").unwrap(), b"fits");
}

#[test]
fn test_writers_serialized_across_handles() {
    let dir = TempDir::new().unwrap();
    let first = Environment::open(dir.path()).unwrap();
    let second = Environment::open(dir.path()).unwrap();

    let mut txn = first.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(&db, b"k1", b"first", WriteFlags::empty()).unwrap();

    // The second handle's writer waits for the first to commit and then
    // builds on its snapshot
    let other = thread::spawn(move || {
        let mut txn = second.begin_rw_txn().unwrap();
        let id = txn.id();
        let db = txn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(txn.get(&db, b"k1").unwrap(), b"first");
        txn.put(&db, b"k2", b"second", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        id
    });
    thread::sleep(Duration::from_millis(50));
    txn.commit().unwrap();
    assert_eq!(other.join().unwrap(), 2);

    let env = Environment::open(dir.path()).unwrap();
    assert_eq!(env.info().unwrap().last_txn_id, 2);
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(txn.get(&db, b"k1").unwrap(), b"first");
    assert_eq!(txn.get(&db, b"k2").unwrap(), b"second");
}

#[test]
fn test_no_lock_commit_over_newer_snapshot_refused() {
    let dir = TempDir::new().unwrap();
    let open = || {
        Environment::builder()
            .set_flags(EnvFlags::NOLOCK)
            .open(dir.path())
            .unwrap()
    };
    let first = open();
    let second = open();

    // Without the lock both handles may begin writers on the same snapshot
    let mut a = first.begin_rw_txn().unwrap();
    let mut b = second.begin_rw_txn().unwrap();
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 1);

    let db = a.open_db(None, DbFlags::empty()).unwrap();
    a.put(&db, b"k1", b"first", WriteFlags::empty()).unwrap();
    let db = b.open_db(None, DbFlags::empty()).unwrap();
    b.put(&db, b"k2", b"second", WriteFlags::empty()).unwrap();

    a.commit().unwrap();
    assert!(matches!(b.commit(), Err(Error::BadTxn)));

    // The first commit survives
    let mut txn = second.begin_ro_txn().unwrap();
    assert_eq!(txn.id(), 1);
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(txn.get(&db, b"k1").unwrap(), b"first");
    assert!(txn.get(&db, b"k2").unwrap_err().is_not_found());
}

#[test]
fn test_readers_full() {
    let dir = TempDir::new().unwrap();
    let env = Environment::builder()
        .set_max_readers(2)
        .open(dir.path())
        .unwrap();

    let _a = env.begin_ro_txn().unwrap();
    let _b = env.begin_ro_txn().unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));
}

#[test]
fn test_reopen_persists() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path()).unwrap();
        env.update(|txn| {
            let db = txn.open_db(None, DbFlags::empty())?;
            txn.put(&db, b"persist", b"yes", WriteFlags::empty())
        })
        .unwrap();
    }

    let env = Environment::open(dir.path()).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(txn.get(&db, b"persist").unwrap(), b"yes");
    assert_eq!(txn.id(), 1);
}

#[test]
fn test_set_map_size() {
    let (_dir, env) = setup_test_env();
    let before = env.info().unwrap().map_size;

    // Busy while a transaction is live
    let reader = env.begin_ro_txn().unwrap();
    assert!(matches!(env.set_map_size(before * 2), Err(Error::EnvBusy)));
    drop(reader);

    env.set_map_size(before * 2).unwrap();
    assert_eq!(env.info().unwrap().map_size, before * 2);

    // Sizes round up to whole pages
    env.set_map_size(before * 2 + 1).unwrap();
    assert_eq!(env.info().unwrap().map_size, before * 2 + 4096);
}

#[test]
fn test_env_flags() {
    let dir = TempDir::new().unwrap();
    let env = Environment::builder()
        .set_flags(EnvFlags::NOSYNC)
        .open(dir.path())
        .unwrap();
    assert!(env.flags().contains(EnvFlags::NOSYNC));

    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.flags().contains(EnvFlags::NOSYNC));
    env.sync(true).unwrap();

    let result = env.set_flags(EnvFlags::NOLOCK, true);
    assert!(matches!(result, Err(Error::Incompatible)));
}

#[test]
fn test_nosubdir() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("single.mdb");
    let env = Environment::builder()
        .set_flags(EnvFlags::NOSUBDIR)
        .open(&path)
        .unwrap();
    env.update(|txn| {
        let db = txn.open_db(None, DbFlags::empty())?;
        txn.put(&db, b"a", b"b", WriteFlags::empty())
    })
    .unwrap();
    assert!(path.is_file());
    assert!(dir.path().join("single.mdb-lock").is_file());
}

#[test]
fn test_run_txn_aborts_on_error() {
    let (_dir, env) = setup_test_env();
    let result = env.run_txn(TransactionFlags::empty(), |txn| {
        let db = txn.open_db(None, DbFlags::empty())?;
        txn.put(&db, b"key", b"value", WriteFlags::empty())?;
        Err(Error::custom("abandon"))
    });
    assert!(matches!(result, Err(Error::Custom(_))));
    assert_eq!(env.stat().unwrap().entries, 0);
}

#[test]
fn test_write_txn_worker() {
    let (_dir, env) = setup_test_env();
    let writer = env.begin_update().unwrap();
    assert_eq!(writer.id(), 1);

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let writer = writer.clone();
            std::thread::spawn(move || {
                writer.run(move |txn| {
                    let db = txn.open_db(None, DbFlags::empty())?;
                    txn.put(&db, &[b'k', i], &[i], WriteFlags::empty())
                })
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    writer.commit().unwrap();
    assert!(matches!(writer.run(|_| Ok(())), Err(Error::WriteTxnClosed)));
    assert_eq!(env.stat().unwrap().entries, 4);
}

#[test]
fn test_write_txn_dropped_aborts() {
    let (_dir, env) = setup_test_env();
    let writer = env.begin_update().unwrap();
    writer
        .run(|txn| {
            let db = txn.open_db(None, DbFlags::empty())?;
            txn.put(&db, b"gone", b"soon", WriteFlags::empty())
        })
        .unwrap();
    drop(writer);

    // Blocks until the worker has aborted and released the writer lock
    let txn = env.begin_rw_txn().unwrap();
    assert_eq!(txn.id(), 1);
    drop(txn);
    assert_eq!(env.stat().unwrap().entries, 0);
}

#[test]
fn test_version() {
    assert_eq!(Environment::version(), (0, 9, 70));
    assert_eq!(Environment::version_string(), "0.9.70");
}
