mod common;

use basalt::btree::BPlusTree;
use basalt::errors::DbError;
use basalt::heap::HeapFile;
use basalt::transaction::Context;
use basalt::types::{encode_row, ColSpec, ColType, Datetime, Value};
use common::*;
use std::sync::Arc;
use tempfile::tempdir;

// Scenario: unique index on (a, b); re-inserting the same pair is refused.
#[test]
fn composite_unique_index_rejects_duplicates() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);

    let specs = [ColSpec::new(ColType::Int, 4), ColSpec::new(ColType::Str, 4)];
    let record_size: usize = specs.iter().map(|s| s.len).sum();
    let heap = Arc::new(
        HeapFile::create("u", dir.path().join("u.tbl"), record_size, db.bpm.clone()).unwrap(),
    );
    let index = Arc::new(
        BPlusTree::create("u_ab", dir.path().join("u_ab.idx"), &specs, None, db.bpm.clone())
            .unwrap(),
    );

    let mut txn = db.txn_mgr.begin(&db.log).unwrap();
    let insert = |txn: &mut basalt::transaction::Transaction, a: i32, b: &str| {
        let row = encode_row(&[Value::Int(a), Value::Str(b.to_string())], &specs)?;
        // The whole row doubles as the composite key here.
        let mut rids = Vec::new();
        if index.get_value(&row, &mut rids)? {
            return Err(DbError::NonUniqueIndex);
        }
        let rid = heap.insert_record(&row, &mut Context::new(&db.lock_mgr, &db.log, txn))?;
        index.insert_entry(&row, rid, Some(txn))?;
        Ok(rid)
    };

    insert(&mut txn, 1, "x").unwrap();
    let err = insert(&mut txn, 1, "x").unwrap_err();
    assert!(matches!(err, DbError::NonUniqueIndex));

    // Same a, different b: a distinct composite key, accepted.
    insert(&mut txn, 1, "y").unwrap();
    db.txn_mgr.commit(&mut txn, &db.log, &db.lock_mgr).unwrap();

    assert_eq!(heap.scan().count(), 2);
}

// Rows of every supported column type survive an encode/store/decode cycle.
#[test]
fn typed_rows_round_trip_through_the_heap() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);

    let specs = [
        ColSpec::new(ColType::Int, 4),
        ColSpec::new(ColType::Bigint, 8),
        ColSpec::new(ColType::Float, 8),
        ColSpec::new(ColType::Str, 10),
        ColSpec::new(ColType::Datetime, 8),
    ];
    let record_size: usize = specs.iter().map(|s| s.len).sum();
    let heap =
        HeapFile::create("m", dir.path().join("m.tbl"), record_size, db.bpm.clone()).unwrap();

    let row = encode_row(
        &[
            Value::Int(-7),
            Value::Bigint(1 << 40),
            Value::Float(2.5),
            Value::Str("hello".to_string()),
            Value::Datetime(Datetime::new(2024, 2, 29, 23, 59, 59)),
        ],
        &specs,
    )
    .unwrap();

    let mut txn = db.txn_mgr.begin(&db.log).unwrap();
    let rid = heap
        .insert_record(&row, &mut Context::new(&db.lock_mgr, &db.log, &mut txn))
        .unwrap();
    db.txn_mgr.commit(&mut txn, &db.log, &db.lock_mgr).unwrap();

    let stored = heap.get_record(rid, &mut Context::none()).unwrap();
    assert_eq!(stored, row);
    assert_eq!(i32::from_le_bytes(stored[0..4].try_into().unwrap()), -7);
    assert_eq!(i64::from_le_bytes(stored[4..12].try_into().unwrap()), 1 << 40);
    assert_eq!(f64::from_le_bytes(stored[12..20].try_into().unwrap()), 2.5);
    assert_eq!(&stored[20..25], b"hello");
    assert_eq!(Datetime::from_bytes(&stored[30..38]), Datetime::new(2024, 2, 29, 23, 59, 59));

    // An impossible date never reaches the page.
    let err = encode_row(
        &[
            Value::Int(0),
            Value::Bigint(0),
            Value::Float(0.0),
            Value::Str("x".to_string()),
            Value::Datetime(Datetime::new(2023, 2, 29, 0, 0, 0)),
        ],
        &specs,
    )
    .unwrap_err();
    assert!(matches!(err, DbError::IncompatibleType { .. }));

    let err = encode_row(&[Value::Int(1)], &specs).unwrap_err();
    assert!(matches!(err, DbError::InvalidValueCount { .. }));
}

// An aborted transaction's heap and index effects vanish while earlier
// committed rows stay intact, end to end through the registry.
#[test]
fn commit_then_abort_sequence_preserves_committed_state() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);
    let (heap, index) = create_t(&db, dir.path());

    let mut registry = basalt::transaction::TableRegistry::new();
    registry.register_table("t", heap.clone());
    registry.register_index(
        "t_a",
        index.clone(),
        basalt::transaction::IndexBinding {
            table: "t".to_string(),
            key_cols: vec![basalt::transaction::KeyCol {
                offset: 0,
                spec: ColSpec::new(ColType::Int, 4),
            }],
        },
    );

    for round in 0..10 {
        let mut txn = db.txn_mgr.begin(&db.log).unwrap();
        insert_row(&db, &heap, &index, &mut txn, round, "keep").unwrap();
        db.txn_mgr.commit(&mut txn, &db.log, &db.lock_mgr).unwrap();

        let mut txn = db.txn_mgr.begin(&db.log).unwrap();
        insert_row(&db, &heap, &index, &mut txn, 100 + round, "drop").unwrap();
        db.txn_mgr
            .abort(&mut txn, &registry, &db.log, &db.lock_mgr)
            .unwrap();
    }

    assert_eq!(all_keys(&index), (0..10).collect::<Vec<_>>());
    assert_eq!(heap.scan().count(), 10);
}
