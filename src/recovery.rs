//! Crash recovery: Analyze, Redo, Undo, then index rebuild.
//!
//! Analyze scans the whole log forward, building the active transaction
//! table (ATT) and the set of log records whose pages may be stale (DPT,
//! kept as LSNs). Redo replays those records idempotently; Undo walks each
//! surviving transaction's prev-LSN chain applying inverses. Indexes are not
//! maintained at node granularity in the log, so every registered index is
//! dropped and rebuilt from its table's heap afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::errors::{DbError, Result};
use crate::transaction::TableRegistry;
use crate::wal::{read_log_record, LogRecord};
use crate::{Lsn, PageId, TxnId, INVALID_LSN};

pub struct RecoveryManager<'a> {
    bpm: &'a Arc<BufferPoolManager>,
    registry: &'a TableRegistry,
    active_txns: HashMap<TxnId, Lsn>,
    lsn_offsets: HashMap<Lsn, u64>,
    dirty_page_lsns: Vec<Lsn>,
    max_txn_id: TxnId,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(bpm: &'a Arc<BufferPoolManager>, registry: &'a TableRegistry) -> Self {
        Self {
            bpm,
            registry,
            active_txns: HashMap::new(),
            lsn_offsets: HashMap::new(),
            dirty_page_lsns: Vec::new(),
            max_txn_id: 0,
        }
    }

    /// Runs all phases. Returns the highest transaction id seen in the log,
    /// so the coordinator can resume numbering past it.
    pub fn recover(mut self) -> Result<TxnId> {
        self.analyze()?;
        self.redo()?;
        self.undo()?;
        self.rebuild_indexes()?;
        self.flush_everything()?;
        Ok(self.max_txn_id)
    }

    /// Transactions that neither committed nor aborted before the crash,
    /// mapped to their latest LSN.
    pub fn active_txns(&self) -> &HashMap<TxnId, Lsn> {
        &self.active_txns
    }

    /// LSNs whose effects may not have reached disk, in log order.
    pub fn dirty_page_lsns(&self) -> &[Lsn] {
        &self.dirty_page_lsns
    }

    /// Forward scan from offset 0. Stops cleanly at a truncated tail record.
    pub fn analyze(&mut self) -> Result<()> {
        let disk = self.bpm.disk();
        let mut offset = 0u64;
        while let Some((record, len)) = read_log_record(disk, offset)? {
            let lsn = record.lsn();
            self.lsn_offsets.insert(lsn, offset);
            self.max_txn_id = self.max_txn_id.max(record.txn_id());

            match &record {
                LogRecord::Begin { txn_id, .. } => {
                    self.active_txns.insert(*txn_id, lsn);
                }
                LogRecord::Commit { txn_id, .. } | LogRecord::Abort { txn_id, .. } => {
                    self.active_txns.remove(txn_id);
                }
                LogRecord::NewPage {
                    txn_id,
                    table,
                    page_no,
                    ..
                } => {
                    self.active_txns.insert(*txn_id, lsn);
                    let heap = self.registry.heap(table)?;
                    // The logged page never reached disk: materialize it with
                    // a sentinel LSN so redo treats it as entirely stale.
                    if !disk.is_flushed(heap.fd(), *page_no)? {
                        let guard = self.bpm.fetch_or_create_page(PageId {
                            fd: heap.fd(),
                            page_no: *page_no,
                        })?;
                        guard.write().set_lsn(INVALID_LSN);
                    }
                }
                LogRecord::Insert { txn_id, table, rid, .. }
                | LogRecord::Delete { txn_id, table, rid, .. }
                | LogRecord::Update { txn_id, table, rid, .. } => {
                    self.active_txns.insert(*txn_id, lsn);
                    let heap = self.registry.heap(table)?;
                    let guard = self.bpm.fetch_or_create_page(PageId {
                        fd: heap.fd(),
                        page_no: rid.page_no,
                    })?;
                    if guard.read().lsn() < lsn {
                        self.dirty_page_lsns.push(lsn);
                    }
                }
            }
            offset += len;
        }
        crate::basalt_debug_log!(
            "[Recovery::analyze] {} active txns, {} stale records",
            self.active_txns.len(),
            self.dirty_page_lsns.len()
        );
        Ok(())
    }

    /// Re-applies every DPT record in LSN order.
    pub fn redo(&mut self) -> Result<()> {
        let mut lsns = self.dirty_page_lsns.clone();
        lsns.sort_unstable();
        for lsn in lsns {
            let record = self.record_at(lsn)?;
            match &record {
                LogRecord::Insert { table, rid, value, .. } => {
                    self.registry.heap(table)?.insert_record_at(*rid, value)?;
                    self.stamp_page_lsn(table, rid.page_no, lsn)?;
                }
                LogRecord::Delete { table, rid, .. } => {
                    self.registry.heap(table)?.delete_record_at(*rid)?;
                    self.stamp_page_lsn(table, rid.page_no, lsn)?;
                }
                LogRecord::Update {
                    table,
                    rid,
                    new_value,
                    ..
                } => {
                    self.registry.heap(table)?.update_record_at(*rid, new_value)?;
                    self.stamp_page_lsn(table, rid.page_no, lsn)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Rolls back every transaction still in the ATT, newest record first.
    pub fn undo(&mut self) -> Result<()> {
        let targets: Vec<(TxnId, Lsn)> =
            self.active_txns.iter().map(|(&t, &l)| (t, l)).collect();
        for (txn_id, mut lsn) in targets {
            crate::basalt_debug_log!("[Recovery::undo] rolling back txn {txn_id}");
            while lsn != INVALID_LSN {
                let record = self.record_at(lsn)?;
                match &record {
                    LogRecord::Insert { table, rid, .. } => {
                        self.registry.heap(table)?.delete_record_at(*rid)?;
                    }
                    LogRecord::Delete { table, rid, value, .. } => {
                        self.registry.heap(table)?.insert_record_at(*rid, value)?;
                    }
                    LogRecord::Update {
                        table,
                        rid,
                        old_value,
                        ..
                    } => {
                        self.registry.heap(table)?.update_record_at(*rid, old_value)?;
                    }
                    _ => {}
                }
                lsn = record.prev_lsn();
            }
        }
        Ok(())
    }

    /// Drops and reconstructs every registered secondary index from the
    /// current record heap.
    pub fn rebuild_indexes(&mut self) -> Result<()> {
        for (name, (tree, binding)) in self.registry.indexes() {
            crate::basalt_debug_log!("[Recovery::rebuild_indexes] rebuilding {name}");
            tree.clear()?;
            let heap = self.registry.heap(&binding.table)?;
            for entry in heap.scan() {
                let (rid, record) = entry?;
                let key = binding.key_from_record(&record);
                tree.insert_entry(&key, rid, None)?;
            }
        }
        Ok(())
    }

    fn record_at(&self, lsn: Lsn) -> Result<LogRecord> {
        let offset = *self
            .lsn_offsets
            .get(&lsn)
            .ok_or_else(|| DbError::internal(format!("lsn {lsn} not found in log")))?;
        let (record, _) = read_log_record(self.bpm.disk(), offset)?
            .ok_or_else(|| DbError::internal(format!("unreadable log record at lsn {lsn}")))?;
        Ok(record)
    }

    fn stamp_page_lsn(&self, table: &str, page_no: crate::PageNo, lsn: Lsn) -> Result<()> {
        let heap = self.registry.heap(table)?;
        let guard = self.bpm.fetch_page(PageId {
            fd: heap.fd(),
            page_no,
        })?;
        let mut page = guard.write();
        if page.lsn() < lsn {
            page.set_lsn(lsn);
        }
        Ok(())
    }

    fn flush_everything(&self) -> Result<()> {
        for (_, heap) in self.registry.heaps() {
            self.bpm.flush_all_pages(heap.fd())?;
        }
        for (_, (tree, _)) in self.registry.indexes() {
            self.bpm.flush_all_pages(tree.fd())?;
        }
        Ok(())
    }
}
