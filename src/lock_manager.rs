//! Manages hierarchical table and record locks.
//!
//! Six modes (IS, IX, S, SIX, X plus the empty queue) with the standard
//! multi-granularity compatibility matrix. Deadlocks are prevented with a
//! strict no-wait policy: a conflicting request aborts the requester
//! immediately, so no waits-for graph is needed.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{AbortReason, DbError, Result};
use crate::transaction::{Transaction, TransactionState};
use crate::{FileId, Rid};

/// A lockable resource: a whole table or a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table(FileId),
    Record(FileId, Rid),
}

/// The mode one transaction holds or requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// The aggregate mode of a request queue: the supremum of its granted modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GroupLockMode {
    NonLock,
    IS,
    IX,
    S,
    SIX,
    X,
}

impl LockMode {
    fn group(self) -> GroupLockMode {
        match self {
            LockMode::IntentionShared => GroupLockMode::IS,
            LockMode::IntentionExclusive => GroupLockMode::IX,
            LockMode::Shared => GroupLockMode::S,
            LockMode::SharedIntentionExclusive => GroupLockMode::SIX,
            LockMode::Exclusive => GroupLockMode::X,
        }
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: crate::TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: Vec<LockRequest>,
    shared_count: usize,
    ix_count: usize,
    group_mode: Option<GroupLockMode>,
}

impl LockRequestQueue {
    fn group_mode(&self) -> GroupLockMode {
        self.group_mode.unwrap_or(GroupLockMode::NonLock)
    }

    fn position_of(&self, txn_id: crate::TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn_id == txn_id)
    }

    fn grant(&mut self, txn_id: crate::TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared_count += 1,
            LockMode::IntentionExclusive => self.ix_count += 1,
            LockMode::SharedIntentionExclusive => {
                self.shared_count += 1;
                self.ix_count += 1;
            }
            _ => {}
        }
        self.group_mode = Some(self.group_mode().max(mode.group()));
        self.requests.push(LockRequest {
            txn_id,
            mode,
            granted: true,
        });
    }
}

/// The lock manager. The whole lock table sits under one mutex.
#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockRequestQueue>>,
}

/// 2PL preamble shared by every acquire path. Returns false when the
/// transaction is already terminal (the request is refused, not an error).
fn check_lock(txn: &mut Transaction) -> Result<bool> {
    match txn.state() {
        TransactionState::Committed | TransactionState::Aborted => Ok(false),
        TransactionState::Shrinking => Err(DbError::TransactionAbort {
            txn_id: txn.id(),
            reason: AbortReason::LockOnShrinking,
        }),
        TransactionState::Default => {
            txn.set_state(TransactionState::Growing);
            Ok(true)
        }
        TransactionState::Growing => Ok(true),
    }
}

fn no_wait_abort(txn: &Transaction) -> DbError {
    DbError::TransactionAbort {
        txn_id: txn.id(),
        reason: AbortReason::DeadlockPrevention,
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_record(
        &self,
        txn: &mut Transaction,
        rid: Rid,
        fd: FileId,
    ) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let lock_id = LockDataId::Record(fd, rid);
        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(lock_id).or_default();

        // Any prior request by this transaction (IS/S/X) already covers a read.
        if queue.position_of(txn.id()).is_some() {
            return Ok(true);
        }
        if matches!(
            queue.group_mode(),
            GroupLockMode::X | GroupLockMode::IX | GroupLockMode::SIX
        ) {
            return Err(no_wait_abort(txn));
        }
        queue.grant(txn.id(), LockMode::Shared);
        txn.lock_set_mut().insert(lock_id);
        Ok(true)
    }

    pub fn lock_exclusive_on_record(
        &self,
        txn: &mut Transaction,
        rid: Rid,
        fd: FileId,
    ) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let lock_id = LockDataId::Record(fd, rid);
        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(lock_id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            let mode = queue.requests[pos].mode;
            if mode == LockMode::Exclusive {
                return Ok(true);
            }
            // Upgrade is only safe while no other transaction shares the record.
            if matches!(mode, LockMode::IntentionShared | LockMode::Shared)
                && queue.requests.len() == 1
            {
                if mode == LockMode::Shared {
                    queue.shared_count -= 1;
                }
                queue.requests[pos].mode = LockMode::Exclusive;
                queue.group_mode = Some(GroupLockMode::X);
                return Ok(true);
            }
            return Err(no_wait_abort(txn));
        }

        if queue.group_mode() != GroupLockMode::NonLock {
            return Err(no_wait_abort(txn));
        }
        queue.grant(txn.id(), LockMode::Exclusive);
        txn.lock_set_mut().insert(lock_id);
        Ok(true)
    }

    pub fn lock_shared_on_table(&self, txn: &mut Transaction, fd: FileId) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let lock_id = LockDataId::Table(fd);
        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(lock_id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            let mode = queue.requests[pos].mode;
            match mode {
                LockMode::Shared | LockMode::Exclusive | LockMode::SharedIntentionExclusive => {
                    return Ok(true);
                }
                LockMode::IntentionShared
                    if matches!(queue.group_mode(), GroupLockMode::IS | GroupLockMode::S) =>
                {
                    queue.requests[pos].mode = LockMode::Shared;
                    queue.shared_count += 1;
                    queue.group_mode = Some(GroupLockMode::S);
                    return Ok(true);
                }
                LockMode::IntentionExclusive if queue.ix_count == 1 => {
                    queue.requests[pos].mode = LockMode::SharedIntentionExclusive;
                    queue.shared_count += 1;
                    queue.group_mode = Some(GroupLockMode::SIX);
                    return Ok(true);
                }
                _ => return Err(no_wait_abort(txn)),
            }
        }

        if matches!(
            queue.group_mode(),
            GroupLockMode::X | GroupLockMode::IX | GroupLockMode::SIX
        ) {
            return Err(no_wait_abort(txn));
        }
        queue.grant(txn.id(), LockMode::Shared);
        txn.lock_set_mut().insert(lock_id);
        Ok(true)
    }

    pub fn lock_exclusive_on_table(&self, txn: &mut Transaction, fd: FileId) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let lock_id = LockDataId::Table(fd);
        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(lock_id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            if queue.requests[pos].mode == LockMode::Exclusive {
                return Ok(true);
            }
            // Sole requester: whatever we hold upgrades straight to X.
            if queue.requests.len() == 1 {
                match queue.requests[pos].mode {
                    LockMode::Shared => queue.shared_count -= 1,
                    LockMode::IntentionExclusive => queue.ix_count -= 1,
                    LockMode::SharedIntentionExclusive => {
                        queue.shared_count -= 1;
                        queue.ix_count -= 1;
                    }
                    _ => {}
                }
                queue.requests[pos].mode = LockMode::Exclusive;
                queue.group_mode = Some(GroupLockMode::X);
                return Ok(true);
            }
            return Err(no_wait_abort(txn));
        }

        if queue.group_mode() != GroupLockMode::NonLock {
            return Err(no_wait_abort(txn));
        }
        queue.grant(txn.id(), LockMode::Exclusive);
        txn.lock_set_mut().insert(lock_id);
        Ok(true)
    }

    pub fn lock_is_on_table(&self, txn: &mut Transaction, fd: FileId) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let lock_id = LockDataId::Table(fd);
        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(lock_id).or_default();

        // Nothing is weaker than IS; any prior request already covers it.
        if queue.position_of(txn.id()).is_some() {
            return Ok(true);
        }
        if queue.group_mode() == GroupLockMode::X {
            return Err(no_wait_abort(txn));
        }
        queue.grant(txn.id(), LockMode::IntentionShared);
        txn.lock_set_mut().insert(lock_id);
        Ok(true)
    }

    pub fn lock_ix_on_table(&self, txn: &mut Transaction, fd: FileId) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let lock_id = LockDataId::Table(fd);
        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(lock_id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            let mode = queue.requests[pos].mode;
            match mode {
                LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
                | LockMode::Exclusive => return Ok(true),
                // The only S holder may escalate to SIX; with other readers
                // present the write intent would invalidate their view.
                LockMode::Shared if queue.shared_count == 1 => {
                    queue.requests[pos].mode = LockMode::SharedIntentionExclusive;
                    queue.ix_count += 1;
                    queue.group_mode = Some(GroupLockMode::SIX);
                    return Ok(true);
                }
                LockMode::IntentionShared
                    if matches!(queue.group_mode(), GroupLockMode::IS | GroupLockMode::IX) =>
                {
                    queue.requests[pos].mode = LockMode::IntentionExclusive;
                    queue.ix_count += 1;
                    queue.group_mode = Some(GroupLockMode::IX);
                    return Ok(true);
                }
                _ => return Err(no_wait_abort(txn)),
            }
        }

        if matches!(
            queue.group_mode(),
            GroupLockMode::S | GroupLockMode::SIX | GroupLockMode::X
        ) {
            return Err(no_wait_abort(txn));
        }
        queue.grant(txn.id(), LockMode::IntentionExclusive);
        txn.lock_set_mut().insert(lock_id);
        Ok(true)
    }

    /// Releases one lock. The first unlock moves the transaction into its
    /// shrinking phase.
    pub fn unlock(&self, txn: &mut Transaction, lock_id: LockDataId) -> Result<bool> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => return Ok(false),
            TransactionState::Growing => txn.set_state(TransactionState::Shrinking),
            _ => {}
        }

        let mut table = self.lock_table.lock().unwrap();
        let Some(queue) = table.get_mut(&lock_id) else {
            return Ok(true);
        };
        let Some(pos) = queue.position_of(txn.id()) else {
            return Ok(true);
        };

        let request = queue.requests.remove(pos);
        match request.mode {
            LockMode::Shared => queue.shared_count -= 1,
            LockMode::IntentionExclusive => queue.ix_count -= 1,
            LockMode::SharedIntentionExclusive => {
                queue.shared_count -= 1;
                queue.ix_count -= 1;
            }
            _ => {}
        }

        if queue.requests.is_empty() {
            table.remove(&lock_id);
        } else {
            queue.group_mode = queue
                .requests
                .iter()
                .map(|r| r.mode.group())
                .max()
                .or(Some(GroupLockMode::NonLock));
        }
        Ok(true)
    }

    /// Granted modes currently present on a queue, for invariant checks.
    pub fn granted_modes(&self, lock_id: LockDataId) -> Vec<LockMode> {
        self.lock_table
            .lock()
            .unwrap()
            .get(&lock_id)
            .map(|queue| {
                queue
                    .requests
                    .iter()
                    .filter(|r| r.granted)
                    .map(|r| r.mode)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The standard multi-granularity compatibility matrix.
pub fn compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
        (IntentionShared, _) | (_, IntentionShared) => true,
        (IntentionExclusive, IntentionExclusive) => true,
        (IntentionExclusive, _) | (_, IntentionExclusive) => false,
        (Shared, Shared) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn txn(id: crate::TxnId) -> Transaction {
        Transaction::new(id, id as u64)
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let mut t2 = txn(2);
        let rid = Rid { page_no: 1, slot_no: 0 };

        assert!(lm.lock_shared_on_record(&mut t1, rid, 0).unwrap());
        assert!(lm.lock_shared_on_record(&mut t2, rid, 0).unwrap());

        let modes = lm.granted_modes(LockDataId::Record(0, rid));
        assert_eq!(modes.len(), 2);
        for (i, &a) in modes.iter().enumerate() {
            for &b in &modes[i + 1..] {
                assert!(compatible(a, b));
            }
        }
    }

    #[test]
    fn exclusive_conflicts_abort_under_no_wait() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let mut t2 = txn(2);
        let rid = Rid { page_no: 1, slot_no: 0 };

        assert!(lm.lock_exclusive_on_record(&mut t1, rid, 0).unwrap());
        let err = lm.lock_shared_on_record(&mut t2, rid, 0).unwrap_err();
        assert!(matches!(
            err,
            DbError::TransactionAbort {
                reason: AbortReason::DeadlockPrevention,
                ..
            }
        ));
    }

    #[test]
    fn shared_upgrades_to_exclusive_when_alone() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let rid = Rid { page_no: 1, slot_no: 0 };

        assert!(lm.lock_shared_on_record(&mut t1, rid, 0).unwrap());
        assert!(lm.lock_exclusive_on_record(&mut t1, rid, 0).unwrap());
        assert_eq!(
            lm.granted_modes(LockDataId::Record(0, rid)),
            vec![LockMode::Exclusive]
        );
    }

    #[test]
    fn upgrade_refused_with_other_readers() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let mut t2 = txn(2);
        let rid = Rid { page_no: 1, slot_no: 0 };

        assert!(lm.lock_shared_on_record(&mut t1, rid, 0).unwrap());
        assert!(lm.lock_shared_on_record(&mut t2, rid, 0).unwrap());
        assert!(lm.lock_exclusive_on_record(&mut t1, rid, 0).is_err());
    }

    #[test]
    fn intention_modes_compose_on_tables() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let mut t2 = txn(2);

        assert!(lm.lock_is_on_table(&mut t1, 0).unwrap());
        assert!(lm.lock_ix_on_table(&mut t2, 0).unwrap());
        // A third shared-table request conflicts with the IX holder.
        let mut t3 = txn(3);
        assert!(lm.lock_shared_on_table(&mut t3, 0).is_err());
    }

    #[test]
    fn sole_s_holder_escalates_to_six() {
        let lm = LockManager::new();
        let mut t1 = txn(1);

        assert!(lm.lock_shared_on_table(&mut t1, 0).unwrap());
        assert!(lm.lock_ix_on_table(&mut t1, 0).unwrap());
        assert_eq!(
            lm.granted_modes(LockDataId::Table(0)),
            vec![LockMode::SharedIntentionExclusive]
        );
        // IS remains compatible with SIX; IX does not.
        let mut t2 = txn(2);
        assert!(lm.lock_is_on_table(&mut t2, 0).unwrap());
        assert!(lm.lock_ix_on_table(&mut t2, 0).is_err());
    }

    #[test]
    fn is_upgrades_to_s_under_read_group() {
        let lm = LockManager::new();
        let mut t1 = txn(1);

        assert!(lm.lock_is_on_table(&mut t1, 0).unwrap());
        assert!(lm.lock_shared_on_table(&mut t1, 0).unwrap());
        assert_eq!(lm.granted_modes(LockDataId::Table(0)), vec![LockMode::Shared]);
    }

    #[test]
    fn lock_after_unlock_aborts() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let rid = Rid { page_no: 1, slot_no: 0 };

        assert!(lm.lock_shared_on_record(&mut t1, rid, 0).unwrap());
        assert!(lm.unlock(&mut t1, LockDataId::Record(0, rid)).unwrap());
        assert_eq!(t1.state(), TransactionState::Shrinking);

        let err = lm.lock_shared_on_record(&mut t1, rid, 0).unwrap_err();
        assert!(matches!(
            err,
            DbError::TransactionAbort {
                reason: AbortReason::LockOnShrinking,
                ..
            }
        ));
    }

    #[test]
    fn unlock_recomputes_group_mode() {
        let lm = LockManager::new();
        let mut t1 = txn(1);
        let mut t2 = txn(2);

        assert!(lm.lock_is_on_table(&mut t1, 0).unwrap());
        assert!(lm.lock_shared_on_table(&mut t2, 0).unwrap());
        assert!(lm.unlock(&mut t2, LockDataId::Table(0)).unwrap());

        // Queue aggregate fell back to IS, so a new IX request is admissible.
        let mut t3 = txn(3);
        assert!(lm.lock_ix_on_table(&mut t3, 0).unwrap());
    }
}
