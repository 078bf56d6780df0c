// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use basalt::btree::BPlusTree;
use basalt::buffer_pool::BufferPoolManager;
use basalt::disk_manager::DiskManager;
use basalt::errors::{DbError, Result};
use basalt::heap::HeapFile;
use basalt::lock_manager::LockManager;
use basalt::transaction::{Context, Transaction, TransactionManager};
use basalt::types::{encode_row, ColSpec, ColType, Value};
use basalt::wal::LogManager;
use basalt::Rid;

/// One engine instance over a database directory.
pub struct TestDb {
    pub disk: Arc<DiskManager>,
    pub log: Arc<LogManager>,
    pub bpm: Arc<BufferPoolManager>,
    pub lock_mgr: LockManager,
    pub txn_mgr: TransactionManager,
}

impl TestDb {
    pub fn boot(dir: &Path, initial_txn_id: u32) -> TestDb {
        let disk = Arc::new(DiskManager::new(dir.join("db.log")).unwrap());
        let log = Arc::new(LogManager::new(disk.clone()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(128, disk.clone(), Some(log.clone())));
        TestDb {
            disk,
            log,
            bpm,
            lock_mgr: LockManager::new(),
            txn_mgr: TransactionManager::new(initial_txn_id),
        }
    }
}

/// Schema of the test table `t(a INT, b CHAR(8))` with an index on `(a)`.
pub fn t_specs() -> Vec<ColSpec> {
    vec![ColSpec::new(ColType::Int, 4), ColSpec::new(ColType::Str, 8)]
}

pub fn t_row(a: i32, b: &str) -> Vec<u8> {
    encode_row(&[Value::Int(a), Value::Str(b.to_string())], &t_specs()).unwrap()
}

pub fn t_key(a: i32) -> Vec<u8> {
    a.to_le_bytes().to_vec()
}

pub fn create_t(db: &TestDb, dir: &Path) -> (Arc<HeapFile>, Arc<BPlusTree>) {
    let record_size: usize = t_specs().iter().map(|s| s.len).sum();
    let heap = Arc::new(
        HeapFile::create("t", dir.join("t.tbl"), record_size, db.bpm.clone()).unwrap(),
    );
    let index = Arc::new(
        BPlusTree::create(
            "t_a",
            dir.join("t_a.idx"),
            &[ColSpec::new(ColType::Int, 4)],
            Some(4),
            db.bpm.clone(),
        )
        .unwrap(),
    );
    (heap, index)
}

pub fn open_t(db: &TestDb, dir: &Path) -> (Arc<HeapFile>, Arc<BPlusTree>) {
    let heap = Arc::new(HeapFile::open("t", dir.join("t.tbl"), db.bpm.clone()).unwrap());
    let index = Arc::new(BPlusTree::open("t_a", dir.join("t_a.idx"), db.bpm.clone()).unwrap());
    (heap, index)
}

/// The executor's insert dance: uniqueness probe, heap insert, index insert.
pub fn insert_row(
    db: &TestDb,
    heap: &HeapFile,
    index: &BPlusTree,
    txn: &mut Transaction,
    a: i32,
    b: &str,
) -> Result<Rid> {
    let data = t_row(a, b);
    let key = t_key(a);

    let mut rids = Vec::new();
    if index.get_value(&key, &mut rids)? {
        return Err(DbError::NonUniqueIndex);
    }

    let rid = heap.insert_record(&data, &mut Context::new(&db.lock_mgr, &db.log, txn))?;
    index.insert_entry(&key, rid, Some(txn))?;
    Ok(rid)
}

/// Index keys currently visible over the full leaf chain.
pub fn all_keys(index: &BPlusTree) -> Vec<i32> {
    index
        .scan(index.leaf_begin().unwrap(), index.leaf_end().unwrap())
        .map(|r| i32::from_le_bytes(r.unwrap().0.try_into().unwrap()))
        .collect()
}
