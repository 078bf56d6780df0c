//! Per-transaction state and the transaction coordinator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::btree::BPlusTree;
use crate::errors::{DbError, Result};
use crate::failpoint;
use crate::heap::HeapFile;
use crate::lock_manager::{LockDataId, LockManager};
use crate::types::ColSpec;
use crate::wal::{LogManager, LogRecord};
use crate::{Lsn, PageId, Rid, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One undo entry. Table entries are reversed through the heap, index
/// entries through the tree.
#[derive(Debug, Clone)]
pub enum WriteRecord {
    TableInsert {
        table: String,
        rid: Rid,
    },
    TableDelete {
        table: String,
        rid: Rid,
        value: Vec<u8>,
    },
    TableUpdate {
        table: String,
        rid: Rid,
        old_value: Vec<u8>,
    },
    IndexInsert {
        index: String,
        key: Vec<u8>,
    },
    IndexDelete {
        index: String,
        key: Vec<u8>,
        rid: Rid,
    },
    IndexUpdate {
        index: String,
        rid: Rid,
        old_key: Vec<u8>,
        new_key: Vec<u8>,
    },
}

/// A transaction: id, start timestamp, 2PL state, undo write-set, lock set
/// and the backward log chain head.
pub struct Transaction {
    id: TxnId,
    start_ts: u64,
    state: TransactionState,
    prev_lsn: Lsn,
    write_set: Vec<WriteRecord>,
    lock_set: HashSet<LockDataId>,
    index_latch_pages: Vec<PageId>,
    index_deleted_pages: Vec<PageId>,
}

impl Transaction {
    pub fn new(id: TxnId, start_ts: u64) -> Self {
        Self {
            id,
            start_ts,
            state: TransactionState::Default,
            prev_lsn: INVALID_LSN,
            write_set: Vec::new(),
            lock_set: HashSet::new(),
            index_latch_pages: Vec::new(),
            index_deleted_pages: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn set_prev_lsn(&mut self, lsn: Lsn) {
        self.prev_lsn = lsn;
    }

    pub fn write_set(&self) -> &[WriteRecord] {
        &self.write_set
    }

    pub fn append_write_record(&mut self, record: WriteRecord) {
        self.write_set.push(record);
    }

    pub fn lock_set(&self) -> &HashSet<LockDataId> {
        &self.lock_set
    }

    pub fn lock_set_mut(&mut self) -> &mut HashSet<LockDataId> {
        &mut self.lock_set
    }

    pub fn append_index_latch_page(&mut self, page_id: PageId) {
        self.index_latch_pages.push(page_id);
    }

    pub fn append_index_deleted_page(&mut self, page_id: PageId) {
        self.index_deleted_pages.push(page_id);
    }

    pub fn index_deleted_pages(&self) -> &[PageId] {
        &self.index_deleted_pages
    }

    fn take_write_set(&mut self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.write_set)
    }

    fn clear_sets(&mut self) {
        self.write_set.clear();
        self.lock_set.clear();
        self.index_latch_pages.clear();
        self.index_deleted_pages.clear();
    }
}

/// Collaborator handles threaded through record and index operations, any of
/// which may be absent (recovery and undo run without locking or logging).
pub struct Context<'a> {
    pub lock_mgr: Option<&'a LockManager>,
    pub log_mgr: Option<&'a LogManager>,
    pub txn: Option<&'a mut Transaction>,
}

impl<'a> Context<'a> {
    pub fn new(
        lock_mgr: &'a LockManager,
        log_mgr: &'a LogManager,
        txn: &'a mut Transaction,
    ) -> Self {
        Self {
            lock_mgr: Some(lock_mgr),
            log_mgr: Some(log_mgr),
            txn: Some(txn),
        }
    }

    pub fn none() -> Self {
        Self {
            lock_mgr: None,
            log_mgr: None,
            txn: None,
        }
    }
}

/// One key column of an index: where it sits in the record and how it
/// compares.
#[derive(Debug, Clone, Copy)]
pub struct KeyCol {
    pub offset: usize,
    pub spec: ColSpec,
}

/// How an index derives its keys from its table's records.
#[derive(Debug, Clone)]
pub struct IndexBinding {
    pub table: String,
    pub key_cols: Vec<KeyCol>,
}

impl IndexBinding {
    /// Extracts the packed user key from one record.
    pub fn key_from_record(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.key_cols.iter().map(|c| c.spec.len).sum());
        for col in &self.key_cols {
            key.extend_from_slice(&record[col.offset..col.offset + col.spec.len]);
        }
        key
    }
}

/// Open heap files and indexes by name; the interface the out-of-scope
/// catalog fills in. Undo and recovery resolve their targets here.
#[derive(Default)]
pub struct TableRegistry {
    heaps: HashMap<String, Arc<HeapFile>>,
    indexes: HashMap<String, (Arc<BPlusTree>, IndexBinding)>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&mut self, name: impl Into<String>, heap: Arc<HeapFile>) {
        self.heaps.insert(name.into(), heap);
    }

    pub fn register_index(
        &mut self,
        name: impl Into<String>,
        index: Arc<BPlusTree>,
        binding: IndexBinding,
    ) {
        self.indexes.insert(name.into(), (index, binding));
    }

    pub fn heap(&self, name: &str) -> Result<&Arc<HeapFile>> {
        self.heaps
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn index(&self, name: &str) -> Result<&(Arc<BPlusTree>, IndexBinding)> {
        self.indexes
            .get(name)
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))
    }

    pub fn indexes(&self) -> impl Iterator<Item = (&String, &(Arc<BPlusTree>, IndexBinding))> {
        self.indexes.iter()
    }

    pub fn heaps(&self) -> impl Iterator<Item = (&String, &Arc<HeapFile>)> {
        self.heaps.iter()
    }
}

struct TransactionManagerState {
    next_txn_id: AtomicU32,
    next_timestamp: AtomicU64,
    active: Mutex<HashSet<TxnId>>,
}

/// The transaction coordinator: vends ids and timestamps, tracks the global
/// active set, and drives commit and abort.
pub struct TransactionManager {
    state: Arc<TransactionManagerState>,
}

impl TransactionManager {
    pub fn new(initial_txn_id: TxnId) -> Self {
        Self {
            state: Arc::new(TransactionManagerState {
                next_txn_id: AtomicU32::new(initial_txn_id),
                next_timestamp: AtomicU64::new(0),
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Starts a new transaction: fresh id and timestamp, a BEGIN log record,
    /// and an entry in the global table.
    pub fn begin(&self, log_mgr: &LogManager) -> Result<Transaction> {
        let id = self.state.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let ts = self.state.next_timestamp.fetch_add(1, Ordering::SeqCst);
        let mut txn = Transaction::new(id, ts);
        txn.set_state(TransactionState::Growing);

        let mut record = LogRecord::Begin {
            lsn: INVALID_LSN,
            prev_lsn: txn.prev_lsn(),
            txn_id: id,
        };
        let lsn = log_mgr.add_log_to_buffer(&mut record)?;
        txn.set_prev_lsn(lsn);

        self.state.active.lock().unwrap().insert(id);
        crate::basalt_debug_log!("[TM::begin] started txn {id}");
        Ok(txn)
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.state.active.lock().unwrap().contains(&txn_id)
    }

    /// Commits: COMMIT log record, lock release, set teardown, log flush.
    pub fn commit(
        &self,
        txn: &mut Transaction,
        log_mgr: &LogManager,
        lock_mgr: &LockManager,
    ) -> Result<()> {
        failpoint::maybe_fail("tm.commit.before_log")?;

        let mut record = LogRecord::Commit {
            lsn: INVALID_LSN,
            prev_lsn: txn.prev_lsn(),
            txn_id: txn.id(),
        };
        let lsn = log_mgr.add_log_to_buffer(&mut record)?;
        txn.set_prev_lsn(lsn);

        failpoint::maybe_fail("tm.commit.after_log")?;

        self.release_locks(txn, lock_mgr)?;
        txn.clear_sets();
        log_mgr.flush_log_to_disk()?;
        txn.set_state(TransactionState::Committed);
        self.state.active.lock().unwrap().remove(&txn.id());
        crate::basalt_debug_log!("[TM::commit] committed txn {}", txn.id());
        Ok(())
    }

    /// Aborts: walk the write-set backwards applying compensating actions,
    /// then ABORT record, lock release, set teardown, log flush.
    pub fn abort(
        &self,
        txn: &mut Transaction,
        registry: &TableRegistry,
        log_mgr: &LogManager,
        lock_mgr: &LockManager,
    ) -> Result<()> {
        crate::basalt_debug_log!("[TM::abort] aborting txn {}", txn.id());
        let write_set = txn.take_write_set();
        for record in write_set.into_iter().rev() {
            match record {
                WriteRecord::TableInsert { table, rid } => {
                    registry.heap(&table)?.delete_record(rid, &mut Context::none())?;
                }
                WriteRecord::TableDelete { table, rid, value } => {
                    registry.heap(&table)?.insert_record_at(rid, &value)?;
                }
                WriteRecord::TableUpdate { table, rid, old_value } => {
                    registry
                        .heap(&table)?
                        .update_record(rid, &old_value, &mut Context::none())?;
                }
                WriteRecord::IndexInsert { index, key } => {
                    registry.index(&index)?.0.delete_entry(&key, None)?;
                }
                WriteRecord::IndexDelete { index, key, rid } => {
                    registry.index(&index)?.0.insert_entry(&key, rid, None)?;
                }
                WriteRecord::IndexUpdate {
                    index,
                    rid,
                    old_key,
                    new_key,
                } => {
                    let (tree, _) = registry.index(&index)?;
                    tree.delete_entry(&new_key, None)?;
                    tree.insert_entry(&old_key, rid, None)?;
                }
            }
        }

        failpoint::maybe_fail("tm.abort.before_abort_record")?;

        let mut record = LogRecord::Abort {
            lsn: INVALID_LSN,
            prev_lsn: txn.prev_lsn(),
            txn_id: txn.id(),
        };
        let lsn = log_mgr.add_log_to_buffer(&mut record)?;
        txn.set_prev_lsn(lsn);

        self.release_locks(txn, lock_mgr)?;
        txn.clear_sets();
        log_mgr.flush_log_to_disk()?;
        txn.set_state(TransactionState::Aborted);
        self.state.active.lock().unwrap().remove(&txn.id());
        Ok(())
    }

    fn release_locks(&self, txn: &mut Transaction, lock_mgr: &LockManager) -> Result<()> {
        let locks: Vec<LockDataId> = txn.lock_set().iter().copied().collect();
        for lock_id in locks {
            lock_mgr.unlock(txn, lock_id)?;
        }
        Ok(())
    }
}
