mod common;

use common::*;
use tempfile::tempdir;

// Scenario: single-column index over t(a INT, b CHAR(8)).
#[test]
fn single_column_index_lookup_and_range_scan() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);
    let (heap, index) = create_t(&db, dir.path());

    let mut txn = db.txn_mgr.begin(&db.log).unwrap();
    let mut rids = std::collections::HashMap::new();
    for (a, b) in [(1, "x"), (3, "y"), (2, "z"), (5, "w"), (4, "v")] {
        let rid = insert_row(&db, &heap, &index, &mut txn, a, b).unwrap();
        rids.insert(a, rid);
    }
    db.txn_mgr.commit(&mut txn, &db.log, &db.lock_mgr).unwrap();

    let mut found = Vec::new();
    assert!(index.get_value(&t_key(3), &mut found).unwrap());
    assert_eq!(found, vec![rids[&3]]);

    let begin = index.lower_bound(&t_key(3)).unwrap();
    let end = index.upper_bound(&t_key(4)).unwrap();
    let keys: Vec<i32> = index
        .scan(begin, end)
        .map(|r| i32::from_le_bytes(r.unwrap().0.try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![3, 4]);

    assert!(index.delete_entry(&t_key(3), None).unwrap());
    assert_eq!(all_keys(&index), vec![1, 2, 4, 5]);
}

// Scenario: with order 4, insert 1..10 then delete in the same order; the
// tree must stay well formed at every step and end empty.
#[test]
fn order_four_split_then_coalesce_to_empty() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);
    let (_heap, index) = create_t(&db, dir.path());

    for a in 1..=10 {
        index
            .insert_entry(&t_key(a), basalt::Rid { page_no: a as u32, slot_no: 0 }, None)
            .unwrap();
        let keys = all_keys(&index);
        assert_eq!(keys, (1..=a).collect::<Vec<_>>());
    }

    for a in 1..=10 {
        assert!(index.delete_entry(&t_key(a), None).unwrap());
        let keys = all_keys(&index);
        assert_eq!(keys, (a + 1..=10).collect::<Vec<_>>());
    }

    assert!(index.is_empty());
    assert_eq!(index.leaf_begin().unwrap(), index.leaf_end().unwrap());
}

// Scenario: unique index on (a); a second insert of the same key must be
// refused before it touches the heap.
#[test]
fn duplicate_key_raises_non_unique_index() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);
    let (heap, index) = create_t(&db, dir.path());

    let mut txn = db.txn_mgr.begin(&db.log).unwrap();
    insert_row(&db, &heap, &index, &mut txn, 1, "x").unwrap();
    let err = insert_row(&db, &heap, &index, &mut txn, 1, "x").unwrap_err();
    assert!(matches!(err, basalt::errors::DbError::NonUniqueIndex));

    // The refused insert left no trace behind.
    assert_eq!(all_keys(&index), vec![1]);
    assert_eq!(heap.scan().count(), 1);
}

#[test]
fn index_rids_resolve_to_heap_records() {
    let dir = tempdir().unwrap();
    let db = TestDb::boot(dir.path(), 1);
    let (heap, index) = create_t(&db, dir.path());

    let mut txn = db.txn_mgr.begin(&db.log).unwrap();
    for a in 0..50 {
        insert_row(&db, &heap, &index, &mut txn, a, "row").unwrap();
    }
    db.txn_mgr.commit(&mut txn, &db.log, &db.lock_mgr).unwrap();

    let mut iid = index.lower_bound(&t_key(0)).unwrap();
    let end = index.leaf_end().unwrap();
    let mut seen = 0;
    while iid != end {
        let rid = index.get_rid(iid).unwrap();
        let record = heap
            .get_record(rid, &mut basalt::transaction::Context::none())
            .unwrap();
        let a = i32::from_le_bytes(record[0..4].try_into().unwrap());
        assert_eq!(a, seen);
        seen += 1;
        iid = index.upper_bound(&t_key(a)).unwrap();
    }
    assert_eq!(seen, 50);
}
