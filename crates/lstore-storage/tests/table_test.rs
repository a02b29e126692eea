//! End-to-end table behavior through the public database API.

use lstore_common::page::PageKind;
use lstore_storage::{
    ColumnType, Database, LStoreError, MergeOutcome, StorageConfig, VersionSpec, Value,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn create_test_config() -> StorageConfig {
    StorageConfig {
        buffer_pool_pages: 256,
        background_merge: false,
        merge_tail_threshold: u32::MAX,
        fsync_enabled: false,
        base_pages_per_range: 1,
        ..Default::default()
    }
}

/// (id INT key, name TEXT(16), score INT)
fn create_grades(db: &Database) -> Arc<lstore_storage::Table> {
    db.create_table(
        "grades",
        vec![ColumnType::Int, ColumnType::Text(16), ColumnType::Int],
        0,
    )
    .unwrap()
}

fn row(id: i64, name: &str, score: i64) -> Vec<Value> {
    vec![Value::Int(id), Value::from(name), Value::Int(score)]
}

#[test]
fn test_update_then_select_as_of() {
    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);

    grades.insert(row(5, "a", 10)).unwrap();
    let before = db.begin();
    grades
        .update(&Value::Int(5), vec![None, None, Some(Value::Int(20))])
        .unwrap();
    db.commit(before).unwrap();

    let latest = grades
        .select(&Value::Int(5), &[0, 1, 2], VersionSpec::Latest)
        .unwrap();
    assert_eq!(latest.values, row(5, "a", 20));

    let as_of = grades
        .select(&Value::Int(5), &[0, 1, 2], VersionSpec::AsOf(before))
        .unwrap();
    assert_eq!(as_of.values, row(5, "a", 10));
}

#[test]
fn test_delete_then_insert_again() {
    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);

    grades.insert(row(5, "a", 10)).unwrap();
    grades.delete(&Value::Int(5)).unwrap();
    assert!(matches!(
        grades.select(&Value::Int(5), &[0], VersionSpec::Latest),
        Err(LStoreError::KeyNotFound)
    ));

    grades.insert(row(5, "b", 11)).unwrap();
    let record = grades
        .select(&Value::Int(5), &[1, 2], VersionSpec::Latest)
        .unwrap();
    assert_eq!(record.values, vec![Value::from("b"), Value::Int(11)]);
}

#[test]
fn test_many_updates_resolve_to_last_writer_per_column() {
    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);
    grades.insert(row(1, "start", 0)).unwrap();

    let mut expected = row(1, "start", 0);
    for n in 1..=300i64 {
        let mut values = vec![None, None, None];
        if n % 2 == 0 {
            values[2] = Some(Value::Int(n));
            expected[2] = Value::Int(n);
        }
        if n % 7 == 0 {
            let name = Value::from(format!("name{}", n));
            values[1] = Some(name.clone());
            expected[1] = name;
        }
        if values.iter().all(Option::is_none) {
            values[2] = Some(Value::Int(-n));
            expected[2] = Value::Int(-n);
        }
        grades.update(&Value::Int(1), values).unwrap();
    }

    let record = grades
        .select(&Value::Int(1), &[0, 1, 2], VersionSpec::Latest)
        .unwrap();
    assert_eq!(record.values, expected);
    // 300 tail versions spill over several tail pages.
    assert_eq!(grades.range_state(0).unwrap().next_tail, 300);
}

#[test]
fn test_merge_keeps_rows_and_removes_tail_traversal() {
    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);
    for id in 0..200 {
        grades.insert(row(id, "x", id)).unwrap();
    }
    for round in 0..5 {
        for id in (0..200).step_by(3) {
            grades
                .update(&Value::Int(id), vec![None, None, Some(Value::Int(id * 100 + round))])
                .unwrap();
        }
    }

    let before = grades
        .select_range(&Value::Int(0), &Value::Int(199), &[0, 1, 2], VersionSpec::Latest)
        .unwrap();

    assert_eq!(grades.merge_all().unwrap(), 1);

    let after = grades
        .select_range(&Value::Int(0), &Value::Int(199), &[0, 1, 2], VersionSpec::Latest)
        .unwrap();
    let values = |records: &[lstore_storage::Record]| -> Vec<Vec<Value>> {
        records.iter().map(|r| r.values.clone()).collect()
    };
    assert_eq!(values(&before), values(&after));

    for record in &after {
        assert_eq!(record.rid.kind, PageKind::Base);
    }
    assert_eq!(grades.merge_range(0).unwrap(), MergeOutcome::Skipped);
}

#[test]
fn test_range_queries_and_aggregates() {
    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);
    for id in 1..=20 {
        grades.insert(row(id, "s", id)).unwrap();
    }
    for id in 1..=20 {
        grades.increment(&Value::Int(id), 2).unwrap();
    }

    let total = grades
        .sum(&Value::Int(1), &Value::Int(20), 2, VersionSpec::Latest)
        .unwrap();
    assert_eq!(total, (2..=21).sum::<i64>());

    let previous = grades
        .sum(&Value::Int(1), &Value::Int(20), 2, VersionSpec::Relative(1))
        .unwrap();
    assert_eq!(previous, (1..=20).sum::<i64>());

    let slice = grades
        .select_range(&Value::Int(18), &Value::Int(40), &[2], VersionSpec::Latest)
        .unwrap();
    assert_eq!(slice.len(), 3);
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 250;
    const KEYS: i64 = 8;

    let config = StorageConfig {
        merge_tail_threshold: 1,
        ..create_test_config()
    };
    let db = Database::in_memory(config).unwrap();
    let counters = db
        .create_table("counters", vec![ColumnType::Int, ColumnType::Int], 0)
        .unwrap();
    for key in 0..KEYS {
        counters.insert(vec![Value::Int(key), Value::Int(0)]).unwrap();
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let counters = Arc::clone(&counters);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut done = vec![0i64; KEYS as usize];
                for _ in 0..INCREMENTS {
                    let key = rng.gen_range(0..KEYS);
                    counters.increment(&Value::Int(key), 1).unwrap();
                    done[key as usize] += 1;

                    let probe = rng.gen_range(0..KEYS);
                    let record = counters
                        .select(&Value::Int(probe), &[1], VersionSpec::Latest)
                        .unwrap();
                    assert!(record.values[0].as_int().unwrap() >= 0);
                }
                done
            })
        })
        .collect();

    let mut expected = vec![0i64; KEYS as usize];
    for handle in handles {
        for (total, done) in expected.iter_mut().zip(handle.join().unwrap()) {
            *total += done;
        }
    }

    for key in 0..KEYS {
        let record = counters
            .select(&Value::Int(key), &[1], VersionSpec::Latest)
            .unwrap();
        assert_eq!(record.values[0], Value::Int(expected[key as usize]));
    }
    assert_eq!(db.buffer_stats().pinned_frames, 0);
}

#[test]
fn test_concurrent_inserts_across_ranges() {
    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 600;

    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let grades = Arc::clone(&grades);
            thread::spawn(move || {
                for n in 0..PER_THREAD {
                    let id = t * PER_THREAD + n;
                    grades.insert(row(id, "c", id)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(grades.len(), (THREADS * PER_THREAD) as usize);
    assert!(grades.num_ranges() > 1);
    let total = grades
        .sum(&Value::Int(0), &Value::Int(i64::MAX), 2, VersionSpec::Latest)
        .unwrap();
    let n = THREADS * PER_THREAD;
    assert_eq!(total, n * (n - 1) / 2);
}

#[test]
fn test_rollback_restores_previous_state() {
    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);
    grades.insert(row(1, "one", 1)).unwrap();
    grades.create_index(1).unwrap();

    let marker = db.begin();
    grades.insert(row(2, "two", 2)).unwrap();
    grades
        .update(&Value::Int(1), vec![None, Some(Value::from("uno")), None])
        .unwrap();
    grades.delete(&Value::Int(1)).unwrap();
    assert_eq!(db.discard_since(marker).unwrap(), 3);

    let record = grades
        .select(&Value::Int(1), &[0, 1, 2], VersionSpec::Latest)
        .unwrap();
    assert_eq!(record.values, row(1, "one", 1));
    assert!(grades.locate(&Value::Int(2)).is_none());
    assert_eq!(
        grades
            .select_by(1, &Value::from("one"), &[0], VersionSpec::Latest)
            .unwrap()
            .len(),
        1
    );

    // Nothing open any more, so merging proceeds.
    assert!(matches!(
        grades.merge_range(0).unwrap(),
        MergeOutcome::Merged { .. }
    ));
}

#[test]
fn test_merges_racing_rollbacks_restore_values() {
    const ROUNDS: i64 = 300;
    const KEYS: i64 = 8;

    let db = Database::in_memory(create_test_config()).unwrap();
    let grades = create_grades(&db);
    for id in 0..KEYS {
        grades.insert(row(id, "r", id)).unwrap();
    }
    grades.create_index(1).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..ROUNDS * 100 {
                if done.load(Ordering::Acquire) {
                    break;
                }
                match grades.merge_range(0) {
                    Ok(_) | Err(LStoreError::MergeConflict { .. }) => {}
                    Err(e) => panic!("merge failed: {}", e),
                }
            }
        });

        for round in 0..ROUNDS {
            let key = Value::Int(round % KEYS);
            grades
                .update(&key, vec![None, None, Some(Value::Int(round))])
                .unwrap();

            let marker = db.begin();
            if round % 2 == 0 {
                grades
                    .update(&key, vec![None, Some(Value::from("gone")), Some(Value::Int(-1))])
                    .unwrap();
            } else {
                grades.delete(&key).unwrap();
            }
            let reverted = db.discard_since(marker);

            let record = grades.select(&key, &[1, 2], VersionSpec::Latest);
            if reverted.is_err() || record.is_err() {
                done.store(true, Ordering::Release);
            }
            assert_eq!(reverted.unwrap(), 1, "round {}", round);
            assert_eq!(
                record.unwrap().values,
                vec![Value::from("r"), Value::Int(round)],
                "round {}",
                round
            );
        }
        done.store(true, Ordering::Release);
    });

    assert!(grades
        .select_by(1, &Value::from("gone"), &[0], VersionSpec::Latest)
        .unwrap()
        .is_empty());
    assert_eq!(
        grades
            .select_by(1, &Value::from("r"), &[0], VersionSpec::Latest)
            .unwrap()
            .len(),
        KEYS as usize
    );
    assert_eq!(db.buffer_stats().pinned_frames, 0);
}

#[test]
fn test_reopen_restores_tables_and_indexes() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        buffer_pool_pages: 8,
        ..StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..create_test_config()
        }
    };

    {
        let db = Database::open_with_config(config.clone()).unwrap();
        let grades = create_grades(&db);
        for id in 0..500 {
            grades.insert(row(id, "base", id)).unwrap();
        }
        for id in (0..500).step_by(5) {
            grades
                .update(&Value::Int(id), vec![None, Some(Value::from("tail")), None])
                .unwrap();
        }
        grades.merge_range(0).unwrap();
        for id in (0..500).step_by(10) {
            grades.increment(&Value::Int(id), 2).unwrap();
        }
        grades.delete(&Value::Int(499)).unwrap();
        grades.create_index(1).unwrap();
        db.create_table("empty", vec![ColumnType::Int], 0).unwrap();
        assert!(db.buffer_stats().evictions > 0);
        db.close().unwrap();
    }

    let db = Database::open_with_config(config).unwrap();
    assert_eq!(db.table_names(), vec!["empty", "grades"]);
    let grades = db.get_table("grades").unwrap();
    assert_eq!(grades.len(), 499);
    assert_eq!(grades.indexed_columns(), vec![1]);

    for id in 0..499 {
        let record = grades
            .select(&Value::Int(id), &[0, 1, 2], VersionSpec::Latest)
            .unwrap();
        let name = if id % 5 == 0 { "tail" } else { "base" };
        let score = if id % 10 == 0 { id + 1 } else { id };
        assert_eq!(record.values, row(id, name, score), "record {}", id);
    }
    assert!(grades.locate(&Value::Int(499)).is_none());

    let tails = grades
        .select_by(1, &Value::from("tail"), &[0], VersionSpec::Latest)
        .unwrap();
    assert_eq!(tails.len(), 100);

    // Cursors survive, so new writes never overwrite persisted versions.
    grades.insert(row(1000, "new", 1)).unwrap();
    grades
        .update(&Value::Int(3), vec![None, None, Some(Value::Int(-3))])
        .unwrap();
    let record = grades
        .select(&Value::Int(5), &[1], VersionSpec::Latest)
        .unwrap();
    assert_eq!(record.values, vec![Value::from("tail")]);

    let empty = db.create_table("later", vec![ColumnType::Int], 0).unwrap();
    assert_eq!(empty.id(), 2);
    db.close().unwrap();
}

#[test]
fn test_drop_table_removes_files() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), 32).unwrap();
    let table = db
        .create_table("scratch", vec![ColumnType::Int, ColumnType::Int], 0)
        .unwrap();
    for id in 0..10 {
        table.insert(vec![Value::Int(id), Value::Int(id)]).unwrap();
    }
    db.checkpoint().unwrap();
    assert!(dir.path().join("t0000").exists());

    db.drop_table("scratch").unwrap();
    assert!(!dir.path().join("t0000").exists());

    // The handle outlives the drop but can no longer write pages back.
    assert!(matches!(
        table.insert(vec![Value::Int(99), Value::Int(99)]),
        Err(LStoreError::TableNotFound(_))
    ));
    assert!(matches!(
        table.update(&Value::Int(1), vec![None, Some(Value::Int(5))]),
        Err(LStoreError::TableNotFound(_))
    ));
    db.checkpoint().unwrap();
    assert!(!dir.path().join("t0000").exists());
    db.close().unwrap();

    let db = Database::open(dir.path(), 32).unwrap();
    assert!(db.table_names().is_empty());
}
