use super::*;
use crate::failpoint;
use crate::file::FileError;
use crate::query::{Query, QueryOp, QueryTransaction, TransactionWorker};
use crate::txn::TxnState;
use crate::wal::LogError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::TempDir;

fn setup_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
    (temp_dir, db)
}

fn insert_committed(db: &Database, table: &Arc<Table>, values: &[i64]) -> Rid {
    db.run(|txn| db.insert(txn, table, values)).unwrap()
}

fn read_committed(db: &Database, table: &Table, rid: Rid, columns: &[usize]) -> DbResult<Vec<i64>> {
    db.run(|txn| db.read(txn, table, rid, columns))
}

#[test]
fn test_insert_update_read_round_trip() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();

    let rid = insert_committed(&db, &table, &[1, 2, 3]);
    let inserted_at = db.engine().txns().clock();
    db.run(|txn| db.update(txn, &table, rid, &[None, Some(20), None]))
        .unwrap();

    assert_eq!(read_committed(&db, &table, rid, &[0, 1, 2]).unwrap(), vec![1, 20, 3]);
    assert_eq!(
        db.read_as_of(&table, rid, &[0, 1, 2], inserted_at).unwrap(),
        vec![1, 2, 3]
    );
    // before the insert committed the record did not exist
    assert!(matches!(
        db.read_as_of(&table, rid, &[0], inserted_at - 1),
        Err(DbError::RecordNotFound(_))
    ));
}

#[test]
fn test_base_page_holds_102_records() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 5, 0).unwrap();

    db.run(|txn| {
        for key in 0..102 {
            db.insert(txn, &table, &[key, 0, 0, 0, 0])?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(table.stats().base_pages, 1);

    insert_committed(&db, &table, &[102, 0, 0, 0, 0]);
    assert_eq!(table.stats().base_pages, 2);
    assert_eq!(table.stats().records, 103);
}

#[test]
fn test_no_wait_lock_conflict() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);

    let mut first = db.begin().unwrap();
    let mut second = db.begin().unwrap();
    db.update(&mut first, &table, rid, &[None, Some(10), None]).unwrap();

    let result = db.update(&mut second, &table, rid, &[None, Some(20), None]);
    assert!(matches!(result, Err(DbError::LockConflict(_))));
    assert!(result.unwrap_err().is_retryable());
    // shared locks conflict with the writer too
    assert!(matches!(
        db.read(&mut second, &table, rid, &[1]),
        Err(DbError::LockConflict(_))
    ));
    db.abort(&mut second).unwrap();

    db.commit(&mut first).unwrap();
    assert_eq!(read_committed(&db, &table, rid, &[1]).unwrap(), vec![10]);
    assert!(db.engine().locks().is_empty());
}

#[test]
fn test_shared_locks_are_compatible() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);

    let mut first = db.begin().unwrap();
    let mut second = db.begin().unwrap();
    assert_eq!(db.read(&mut first, &table, rid, &[1]).unwrap(), vec![2]);
    assert_eq!(db.read(&mut second, &table, rid, &[1]).unwrap(), vec![2]);
    db.commit(&mut first).unwrap();
    db.commit(&mut second).unwrap();
}

#[test]
fn test_commit_visible_to_later_transactions() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);

    let mut reader = db.begin().unwrap();
    db.run(|txn| db.update(txn, &table, rid, &[None, Some(7), None]))
        .unwrap();

    // the older snapshot keeps its view, a locking read sees the commit
    assert_eq!(
        db.engine().snapshot_read(&reader, &table, rid, &[1]).unwrap(),
        vec![2]
    );
    assert_eq!(db.read(&mut reader, &table, rid, &[1]).unwrap(), vec![7]);
    db.commit(&mut reader).unwrap();

    let later = db.begin().unwrap();
    assert_eq!(
        db.engine().snapshot_read(&later, &table, rid, &[1]).unwrap(),
        vec![7]
    );
}

#[test]
fn test_uncommitted_writes_are_private() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);

    let mut writer = db.begin().unwrap();
    db.update(&mut writer, &table, rid, &[None, None, Some(30)]).unwrap();
    assert_eq!(db.read(&mut writer, &table, rid, &[2]).unwrap(), vec![30]);

    let observer = db.begin().unwrap();
    assert_eq!(
        db.engine().snapshot_read(&observer, &table, rid, &[2]).unwrap(),
        vec![3]
    );

    db.abort(&mut writer).unwrap();
    assert_eq!(read_committed(&db, &table, rid, &[2]).unwrap(), vec![3]);
}

#[test]
fn test_delete_and_abort_delete() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let kept = insert_committed(&db, &table, &[1, 2, 3]);
    let removed = insert_committed(&db, &table, &[2, 4, 6]);

    let mut txn = db.begin().unwrap();
    db.delete(&mut txn, &table, kept).unwrap();
    db.abort(&mut txn).unwrap();
    assert_eq!(read_committed(&db, &table, kept, &[1]).unwrap(), vec![2]);

    db.run(|txn| db.delete(txn, &table, removed)).unwrap();
    assert!(matches!(
        read_committed(&db, &table, removed, &[1]),
        Err(DbError::RecordNotFound(_))
    ));
    assert!(matches!(
        db.run(|txn| db.update(txn, &table, removed, &[None, Some(1), None])),
        Err(DbError::RecordNotFound(_))
    ));
    assert_eq!(table.index().lookup(2), None);
    assert_eq!(table.index().lookup(1), Some(kept));
}

#[test]
fn test_terminated_transaction_rejected() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();

    let mut txn = db.begin().unwrap();
    db.insert(&mut txn, &table, &[1, 2, 3]).unwrap();
    db.commit(&mut txn).unwrap();
    assert_eq!(txn.state(), TxnState::Committed);

    assert!(matches!(
        db.commit(&mut txn),
        Err(DbError::TransactionAlreadyTerminated(_))
    ));
    assert!(matches!(
        db.abort(&mut txn),
        Err(DbError::TransactionAlreadyTerminated(_))
    ));
    assert!(matches!(
        db.insert(&mut txn, &table, &[2, 2, 3]),
        Err(DbError::TransactionAlreadyTerminated(_))
    ));
}

#[test]
fn test_dropped_transaction_aborts() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();

    {
        let mut txn = db.begin().unwrap();
        db.insert(&mut txn, &table, &[1, 2, 3]).unwrap();
    }
    assert_eq!(table.index().lookup(1), None);
    assert!(db.engine().locks().is_empty());
    assert_eq!(db.engine().txns().active_count(), 0);
}

#[test]
fn test_schema_checks() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();

    assert!(matches!(
        db.run(|txn| db.insert(txn, &table, &[1, 2])),
        Err(DbError::SchemaMismatch { expected: 3, actual: 2 })
    ));
    let rid = insert_committed(&db, &table, &[1, 2, 3]);
    assert!(matches!(
        read_committed(&db, &table, rid, &[3]),
        Err(DbError::InvalidColumn { column: 3, .. })
    ));
}

#[test]
fn test_key_update_moves_index_entry() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);

    let mut txn = db.begin().unwrap();
    db.update(&mut txn, &table, rid, &[Some(5), None, None]).unwrap();
    db.abort(&mut txn).unwrap();
    assert_eq!(table.index().lookup(1), Some(rid));
    assert_eq!(table.index().lookup(5), None);

    db.run(|txn| db.update(txn, &table, rid, &[Some(5), None, None]))
        .unwrap();
    assert_eq!(table.index().lookup(1), None);
    assert_eq!(table.index().lookup(5), Some(rid));

    let other = insert_committed(&db, &table, &[1, 0, 0]);
    assert!(matches!(
        db.run(|txn| db.update(txn, &table, other, &[Some(5), None, None])),
        Err(DbError::DuplicateKey(5))
    ));
}

#[test]
fn test_merge_is_transparent() {
    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig {
        merge_threshold: 10,
        ..EngineConfig::default()
    };
    let db = Database::open(temp_dir.path(), config).unwrap();
    let table = db.create_table("grades", 4, 0).unwrap();
    let query = Query::new(&db, Arc::clone(&table));

    for key in 0..50 {
        query.insert(&[key, key, 0, 0]).unwrap();
    }
    for round in 1..=3 {
        for key in 0..50 {
            query
                .update(key, &[None, None, Some(key * round), Some(round)])
                .unwrap();
        }
    }
    query.delete(7).unwrap();

    let rids = table.rids();
    let before: Vec<DbResult<Vec<i64>>> = rids
        .iter()
        .map(|rid| read_committed(&db, &table, *rid, &[0, 1, 2, 3]))
        .collect();

    db.wait_for_merges();
    db.engine().merge_now(&table, 0).unwrap();

    let range = table.range(0).unwrap();
    assert_eq!(range.read().merged_ts, db.engine().txns().clock());
    for (rid, expected) in rids.iter().zip(&before) {
        let actual = read_committed(&db, &table, *rid, &[0, 1, 2, 3]);
        match expected {
            Ok(values) => assert_eq!(&actual.unwrap(), values),
            Err(_) => assert!(matches!(actual, Err(DbError::RecordNotFound(_)))),
        }
    }
    assert_eq!(query.select(12, 0, &[true; 4]).unwrap()[0].columns[2], Some(36));

    // reads and writes keep working on merged pages
    query.update(12, &[None, Some(-1), None, None]).unwrap();
    assert_eq!(query.select(12, 0, &[true; 4]).unwrap()[0].columns[1], Some(-1));
}

#[test]
fn test_merge_transparent_to_running_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig {
        merge_threshold: 1_000_000,
        ..EngineConfig::default()
    };
    let db = Database::open(temp_dir.path(), config).unwrap();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rids: Vec<Rid> = (0..40)
        .map(|key| insert_committed(&db, &table, &[key, key, 0]))
        .collect();
    for rid in &rids {
        db.run(|txn| db.update(txn, &table, *rid, &[None, None, Some(1)]))
            .unwrap();
    }

    let mut reader = db.begin().unwrap();
    let expected: Vec<Vec<i64>> = rids
        .iter()
        .map(|rid| db.engine().snapshot_read(&reader, &table, *rid, &[0, 1, 2]).unwrap())
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let engine = Arc::clone(db.engine());
        let table = Arc::clone(&table);
        let rids = rids.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 2;
            loop {
                for rid in &rids {
                    run_in_transaction(&engine, |txn| {
                        engine.update(txn, &table, *rid, &[None, Some(-round), Some(round)])
                    })
                    .unwrap();
                }
                round += 1;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        })
    };
    let merger = {
        let engine = Arc::clone(db.engine());
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for _ in 0..10 {
                engine.merge_now(&table, 0).unwrap();
            }
        })
    };

    while !merger.is_finished() {
        for (rid, values) in rids.iter().zip(&expected) {
            assert_eq!(
                &db.engine().snapshot_read(&reader, &table, *rid, &[0, 1, 2]).unwrap(),
                values
            );
        }
    }
    merger.join().unwrap();
    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();

    let range = table.range(0).unwrap();
    assert!(range.read().merged_ts <= reader.start_ts());
    for (rid, values) in rids.iter().zip(&expected) {
        assert_eq!(
            &db.engine().snapshot_read(&reader, &table, *rid, &[0, 1, 2]).unwrap(),
            values
        );
    }
    db.commit(&mut reader).unwrap();

    // with the reader gone everything folds
    db.engine().merge_now(&table, 0).unwrap();
    assert_eq!(range.read().merged_ts, db.engine().txns().clock());
    for (key, rid) in rids.iter().enumerate() {
        let values = read_committed(&db, &table, *rid, &[0, 1, 2]).unwrap();
        assert_eq!(values[0], key as i64);
        assert_eq!(values[1], -values[2]);
    }
}

#[test]
fn test_merge_failure_keeps_pages() {
    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig {
        merge_threshold: 1_000_000,
        ..EngineConfig::default()
    };
    let db = Database::open(temp_dir.path(), config).unwrap();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);
    db.run(|txn| db.update(txn, &table, rid, &[None, Some(9), None]))
        .unwrap();
    let base_before = table.range(0).unwrap().read().base.clone();

    failpoint::enable(failpoint::MERGE_SWAP);
    let result = db.engine().merge_now(&table, 0);
    failpoint::disable(failpoint::MERGE_SWAP);

    assert!(result.is_err());
    assert_eq!(table.range(0).unwrap().read().base, base_before);
    assert_eq!(read_committed(&db, &table, rid, &[1]).unwrap(), vec![9]);
}

#[test]
fn test_recovery_redoes_committed_updates() {
    let temp_dir = TempDir::new().unwrap();
    let (rid, clock) = {
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        let rid = insert_committed(&db, &table, &[1, 2, 3]);
        db.run(|txn| db.update(txn, &table, rid, &[None, Some(20), None]))
            .unwrap();
        let clock = db.engine().txns().clock();
        // nothing was flushed; only the log survives
        db.simulate_crash();
        (rid, clock)
    };

    let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
    let table = db.get_table("grades").unwrap();
    assert_eq!(read_committed(&db, &table, rid, &[0, 1, 2]).unwrap(), vec![1, 20, 3]);
    assert_eq!(db.read_as_of(&table, rid, &[1], clock - 1).unwrap(), vec![2]);
    assert_eq!(table.index().lookup(1), Some(rid));
    assert!(db.engine().txns().clock() >= clock);

    // new records do not reuse recovered RIDs
    let next = insert_committed(&db, &table, &[2, 0, 0]);
    assert!(next > rid);
}

#[test]
fn test_recovery_undoes_uncommitted_updates() {
    let temp_dir = TempDir::new().unwrap();
    let rid = {
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        let rid = insert_committed(&db, &table, &[1, 2, 3]);

        let mut loser = db.begin().unwrap();
        db.update(&mut loser, &table, rid, &[None, Some(99), None]).unwrap();
        db.insert(&mut loser, &table, &[2, 5, 5]).unwrap();
        // the uncommitted changes reach disk
        db.checkpoint().unwrap();
        db.simulate_crash();
        drop(loser);
        rid
    };

    let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
    let table = db.get_table("grades").unwrap();
    assert_eq!(read_committed(&db, &table, rid, &[0, 1, 2]).unwrap(), vec![1, 2, 3]);
    assert_eq!(table.index().lookup(2), None);
    assert_eq!(table.index().len(), 1);

    // the rolled back update does not block new writers
    db.run(|txn| db.update(txn, &table, rid, &[None, Some(4), None]))
        .unwrap();
    assert_eq!(read_committed(&db, &table, rid, &[1]).unwrap(), vec![4]);
}

#[test]
fn test_recovery_after_merge() {
    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig {
        merge_threshold: 1_000_000,
        ..EngineConfig::default()
    };
    let (rids, merged_base) = {
        let db = Database::open(temp_dir.path(), config.clone()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        let rids: Vec<Rid> = (0..120)
            .map(|key| insert_committed(&db, &table, &[key, 0, 0]))
            .collect();
        for rid in &rids {
            db.run(|txn| db.update(txn, &table, *rid, &[None, Some(1), None]))
                .unwrap();
        }
        db.run(|txn| db.delete(txn, &table, rids[3])).unwrap();

        db.engine().merge_now(&table, 0).unwrap();
        let merged_base = table.range(0).unwrap().read().base.clone();

        // changes after the merge exist only in the log
        for rid in &rids[..10] {
            db.run(|txn| db.update(txn, &table, *rid, &[None, None, Some(2)]))
                .unwrap();
        }
        db.simulate_crash();
        (rids, merged_base)
    };

    let db = Database::open(temp_dir.path(), config).unwrap();
    let table = db.get_table("grades").unwrap();
    assert_eq!(table.range(0).unwrap().read().base, merged_base);
    for (key, rid) in rids.iter().enumerate() {
        let values = read_committed(&db, &table, *rid, &[0, 1, 2]);
        match key {
            3 => assert!(matches!(values, Err(DbError::RecordNotFound(_)))),
            0..10 => assert_eq!(values.unwrap(), vec![key as i64, 1, 2]),
            _ => assert_eq!(values.unwrap(), vec![key as i64, 1, 0]),
        }
    }
    assert_eq!(table.index().lookup(3), None);
    assert_eq!(table.index().len(), 119);
}

#[test]
fn test_buffer_pool_exhaustion_is_retryable() {
    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig {
        buffer_pool_pages: 8,
        ..EngineConfig::default()
    };
    let db = Database::open(temp_dir.path(), config).unwrap();
    let table = db.create_table("grades", 3, 0).unwrap();
    insert_committed(&db, &table, &[1, 0, 0]);

    // hold every frame
    let pool = db.engine().pool();
    let pinned: Vec<_> = (0..pool.capacity() as u32)
        .map(|i| pool.fetch(table.file(), 1000 + i).unwrap())
        .collect();

    let result = db.run(|txn| db.insert(txn, &table, &[2, 0, 0]));
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        DbError::File(FileError::BufferPoolExhausted { capacity: 8 })
    ));
    assert!(err.is_retryable());
    assert_eq!(db.engine().txns().active_count(), 0);
    assert!(db.engine().locks().is_empty());

    drop(pinned);
    let rid = insert_committed(&db, &table, &[2, 0, 0]);
    assert_eq!(read_committed(&db, &table, rid, &[0]).unwrap(), vec![2]);
}

#[test]
fn test_new_snapshots_include_returned_commits() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rids: Vec<Rid> = (0..4)
        .map(|key| insert_committed(&db, &table, &[key, 0, 0]))
        .collect();

    let handles: Vec<_> = rids
        .iter()
        .map(|&rid| {
            let engine = Arc::clone(db.engine());
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for round in 1..=50 {
                    let mut txn = engine.begin().unwrap();
                    engine
                        .update(&mut txn, &table, rid, &[None, Some(round), None])
                        .unwrap();
                    engine.commit(&mut txn).unwrap();
                    let commit_ts = txn.commit_ts().unwrap();

                    let mut next = engine.begin().unwrap();
                    assert!(next.start_ts() >= commit_ts);
                    assert_eq!(
                        engine.snapshot_read(&next, &table, rid, &[1]).unwrap(),
                        vec![round]
                    );
                    engine.commit(&mut next).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(db.engine().txns().visible_ts(), db.engine().txns().clock());
}

#[test]
fn test_clean_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let rid = {
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        let rid = insert_committed(&db, &table, &[1, 2, 3]);
        db.run(|txn| db.update(txn, &table, rid, &[None, None, Some(30)]))
            .unwrap();
        db.close().unwrap();
        rid
    };

    let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
    let table = db.get_table("grades").unwrap();
    assert_eq!(read_committed(&db, &table, rid, &[0, 1, 2]).unwrap(), vec![1, 2, 30]);
    assert_eq!(table.stats().records, 1);
}

#[test]
fn test_failed_commit_log_is_not_durable() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    let rid = insert_committed(&db, &table, &[1, 2, 3]);

    let mut txn = db.begin().unwrap();
    db.update(&mut txn, &table, rid, &[None, Some(50), None]).unwrap();
    failpoint::enable(failpoint::WAL_APPEND);
    let result = db.commit(&mut txn);
    failpoint::disable(failpoint::WAL_APPEND);

    assert!(matches!(result, Err(DbError::Durability { .. })));
    assert_eq!(txn.state(), TxnState::Aborted);
    assert_eq!(read_committed(&db, &table, rid, &[1]).unwrap(), vec![2]);
    assert!(db.engine().locks().is_empty());
}

#[test]
fn test_corrupted_page_detected() {
    let temp_dir = TempDir::new().unwrap();
    {
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        insert_committed(&db, &table, &[1, 2, 3]);
        db.close().unwrap();
    }

    let page = temp_dir.path().join("grades").join("pages").join("0.page");
    let mut bytes = std::fs::read(&page).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&page, bytes).unwrap();

    let result = Database::open(temp_dir.path(), EngineConfig::default());
    assert!(matches!(
        result,
        Err(DbError::File(FileError::PageChecksumMismatch { .. }))
    ));
}

#[test]
fn test_corrupted_log_detected() {
    let temp_dir = TempDir::new().unwrap();
    {
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let table = db.create_table("grades", 3, 0).unwrap();
        for key in 0..5 {
            insert_committed(&db, &table, &[key, 0, 0]);
        }
        db.close().unwrap();
    }

    let log = temp_dir.path().join(LOG_FILE);
    let mut bytes = std::fs::read(&log).unwrap();
    // inside the payload of the first frame, with many frames after it
    let offset = crate::wal::LOG_HEADER_LEN as usize + 12;
    bytes[offset] ^= 0xff;
    std::fs::write(&log, bytes).unwrap();

    let result = Database::open(temp_dir.path(), EngineConfig::default());
    assert!(matches!(
        result,
        Err(DbError::Log(LogError::RecoveryLogCorruption { .. }))
    ));
}

#[test]
fn test_drop_table_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
        let first = db.create_table("first", 2, 0).unwrap();
        let second = db.create_table("second", 2, 1).unwrap();
        insert_committed(&db, &first, &[1, 1]);
        insert_committed(&db, &second, &[2, 2]);

        // creating an existing table hands back the same one
        let again = db.create_table("second", 2, 1).unwrap();
        assert_eq!(again.id(), second.id());

        db.drop_table("first").unwrap();
        assert!(!temp_dir.path().join("first").exists());
        assert!(db.get_table("first").is_err());
        db.close().unwrap();
    }

    let db = Database::open(temp_dir.path(), EngineConfig::default()).unwrap();
    assert_eq!(db.table_names(), vec!["second".to_string()]);
    let second = db.get_table("second").unwrap();
    assert_eq!(second.key_column(), 1);
    assert_eq!(second.index().lookup(2), Some(1));
    assert!(db.drop_table("first").is_err());
}

#[test]
fn test_closed_database_rejects_work() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 3, 0).unwrap();
    db.close().unwrap();

    assert!(matches!(db.begin(), Err(DbError::Closed)));
    assert!(matches!(
        db.read_as_of(&table, 1, &[0], 1),
        Err(DbError::Closed)
    ));
    // closing twice is fine
    db.close().unwrap();
}

#[test]
fn test_concurrent_increments() {
    let (_temp, db) = setup_test_db();
    let table = db.create_table("grades", 5, 0).unwrap();
    let query = Query::new(&db, table);
    for key in 0..20 {
        query.insert(&[key, 0, 0, 0, 0]).unwrap();
    }

    let mut workers: Vec<TransactionWorker> = (0..3)
        .map(|worker| {
            let mut runner = TransactionWorker::new(100);
            for i in 0..20 {
                let key = (i * 7 + worker * 3) % 20;
                let mut txn = QueryTransaction::new();
                for column in 1..5 {
                    txn.add_query(&query, QueryOp::Increment { key, column });
                }
                runner.add_transaction(txn);
            }
            runner
        })
        .collect();
    for worker in &mut workers {
        worker.run().unwrap();
    }
    let committed: usize = workers.iter_mut().map(|worker| worker.join().committed).sum();

    let mut total = 0;
    for key in 0..20 {
        let record = &query.select(key, 0, &[true; 5]).unwrap()[0];
        let first = record.columns[1];
        assert!(record.columns[1..].iter().all(|value| *value == first));
        total += first.unwrap();
    }
    assert_eq!(total as usize, committed);
    assert!(committed > 0);
}
