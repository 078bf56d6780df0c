use std::io;
use thiserror::Error;

use crate::TxnId;

/// Why a transaction was forcibly aborted by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock was requested after the transaction released one (2PL violation).
    LockOnShrinking,
    /// The no-wait policy refused a conflicting lock request.
    DeadlockPrevention,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("incompatible type: expected {expected}, got {actual}")]
    IncompatibleType { expected: String, actual: String },

    #[error("invalid value count: expected {expected}, got {actual}")]
    InvalidValueCount { expected: usize, actual: usize },

    #[error("database {0} already exists")]
    DatabaseExists(String),

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("index {0} already exists")]
    IndexExists(String),

    #[error("index {0} not found")]
    IndexNotFound(String),

    #[error("non-unique index: duplicate key")]
    NonUniqueIndex,

    #[error("transaction {txn_id} aborted: {reason:?}")]
    TransactionAbort { txn_id: TxnId, reason: AbortReason },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn internal(msg: impl Into<String>) -> Self {
        DbError::Internal(msg.into())
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Internal(format!("log serialization: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
