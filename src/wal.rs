//! The write-ahead log manager.
//!
//! Records are framed as `[total_len: u32][crc: u32][body]`, little-endian,
//! where the body is the bincode encoding of [`LogRecord`] (fixed-width
//! little-endian integers, length-prefixed strings). Per-transaction records
//! chain backwards through `prev_lsn`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::disk_manager::DiskManager;
use crate::errors::Result;
use crate::{Lsn, PageNo, Rid, TxnId, INVALID_LSN, LOG_BUFFER_SIZE};

/// Bytes of framing in front of every serialized record body.
pub const LOG_FRAME_HEADER_SIZE: usize = 8;

/// A single record in the write-ahead log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogRecord {
    Begin {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
    },
    Commit {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
    },
    Abort {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
    },
    Insert {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
        table: String,
        rid: Rid,
        value: Vec<u8>,
    },
    Delete {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
        table: String,
        rid: Rid,
        value: Vec<u8>,
    },
    Update {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
        table: String,
        rid: Rid,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
    NewPage {
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
        table: String,
        page_no: PageNo,
    },
}

impl LogRecord {
    pub fn lsn(&self) -> Lsn {
        match self {
            LogRecord::Begin { lsn, .. }
            | LogRecord::Commit { lsn, .. }
            | LogRecord::Abort { lsn, .. }
            | LogRecord::Insert { lsn, .. }
            | LogRecord::Delete { lsn, .. }
            | LogRecord::Update { lsn, .. }
            | LogRecord::NewPage { lsn, .. } => *lsn,
        }
    }

    pub fn prev_lsn(&self) -> Lsn {
        match self {
            LogRecord::Begin { prev_lsn, .. }
            | LogRecord::Commit { prev_lsn, .. }
            | LogRecord::Abort { prev_lsn, .. }
            | LogRecord::Insert { prev_lsn, .. }
            | LogRecord::Delete { prev_lsn, .. }
            | LogRecord::Update { prev_lsn, .. }
            | LogRecord::NewPage { prev_lsn, .. } => *prev_lsn,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        match self {
            LogRecord::Begin { txn_id, .. }
            | LogRecord::Commit { txn_id, .. }
            | LogRecord::Abort { txn_id, .. }
            | LogRecord::Insert { txn_id, .. }
            | LogRecord::Delete { txn_id, .. }
            | LogRecord::Update { txn_id, .. }
            | LogRecord::NewPage { txn_id, .. } => *txn_id,
        }
    }

    fn set_lsn(&mut self, new_lsn: Lsn) {
        match self {
            LogRecord::Begin { lsn, .. }
            | LogRecord::Commit { lsn, .. }
            | LogRecord::Abort { lsn, .. }
            | LogRecord::Insert { lsn, .. }
            | LogRecord::Delete { lsn, .. }
            | LogRecord::Update { lsn, .. }
            | LogRecord::NewPage { lsn, .. } => *lsn = new_lsn,
        }
    }
}

struct LogState {
    buffer: Vec<u8>,
    next_lsn: Lsn,
}

/// Buffers serialized records in memory and appends them to the log file.
pub struct LogManager {
    disk: Arc<DiskManager>,
    state: Mutex<LogState>,
    persisted_lsn: AtomicI64,
}

impl LogManager {
    /// Opens the manager over an existing (possibly empty) log file and
    /// resumes LSN assignment past whatever the file already holds.
    pub fn new(disk: Arc<DiskManager>) -> Result<Self> {
        let mut max_lsn = INVALID_LSN;
        let mut offset = 0;
        while let Some((record, total_len)) = read_log_record(&disk, offset)? {
            max_lsn = max_lsn.max(record.lsn());
            offset += total_len;
        }
        Ok(Self {
            disk,
            state: Mutex::new(LogState {
                buffer: Vec::with_capacity(LOG_BUFFER_SIZE),
                next_lsn: max_lsn + 1,
            }),
            persisted_lsn: AtomicI64::new(max_lsn),
        })
    }

    /// Assigns the next LSN to `record`, serializes it into the buffer and
    /// returns the LSN. Flushes first when the buffer lacks room.
    pub fn add_log_to_buffer(&self, record: &mut LogRecord) -> Result<Lsn> {
        // Fixed-width encoding: the frame length does not depend on the LSN
        // we are about to assign.
        let frame_len = LOG_FRAME_HEADER_SIZE + bincode::serialized_size(&*record)? as usize;
        if frame_len > LOG_BUFFER_SIZE {
            return Err(crate::errors::DbError::internal(format!(
                "log record of {frame_len} bytes exceeds the log buffer"
            )));
        }

        let mut state = self.state.lock().unwrap();
        while state.buffer.len() + frame_len > LOG_BUFFER_SIZE {
            drop(state);
            self.flush_log_to_disk()?;
            state = self.state.lock().unwrap();
        }

        let lsn = state.next_lsn;
        state.next_lsn += 1;
        record.set_lsn(lsn);

        let body = bincode::serialize(record)?;
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let total_len = (LOG_FRAME_HEADER_SIZE + body.len()) as u32;
        state.buffer.extend_from_slice(&total_len.to_le_bytes());
        state.buffer.extend_from_slice(&crc.to_le_bytes());
        state.buffer.extend_from_slice(&body);
        crate::basalt_debug_log!(
            "[LogManager::add_log_to_buffer] lsn {lsn}, txn {}, {} buffered bytes",
            record.txn_id(),
            state.buffer.len()
        );
        Ok(lsn)
    }

    /// Appends the buffered bytes to the log file and advances the
    /// persisted-LSN watermark.
    pub fn flush_log_to_disk(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.buffer.is_empty() {
            self.disk.append_log(&state.buffer)?;
            state.buffer.clear();
        }
        self.persisted_lsn.store(state.next_lsn - 1, Ordering::SeqCst);
        Ok(())
    }

    /// The highest LSN guaranteed to be in the log file.
    pub fn persisted_lsn(&self) -> Lsn {
        self.persisted_lsn.load(Ordering::SeqCst)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().unwrap().next_lsn
    }

    #[cfg(test)]
    fn lock_state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap()
    }
}

/// Reads the log record starting at `offset`, returning it with its framed
/// length so callers can advance. A truncated or torn trailing record yields
/// `None`, ending the scan cleanly.
pub fn read_log_record(disk: &DiskManager, offset: u64) -> Result<Option<(LogRecord, u64)>> {
    let mut header = [0u8; LOG_FRAME_HEADER_SIZE];
    if disk.read_log(&mut header, offset)? < LOG_FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let total_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if total_len <= LOG_FRAME_HEADER_SIZE || total_len > LOG_BUFFER_SIZE {
        return Ok(None);
    }

    let mut body = vec![0u8; total_len - LOG_FRAME_HEADER_SIZE];
    if disk.read_log(&mut body, offset + LOG_FRAME_HEADER_SIZE as u64)? < body.len() {
        return Ok(None);
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    if hasher.finalize() != crc {
        crate::basalt_debug_log!("[read_log_record] crc mismatch at offset {offset}, stopping");
        return Ok(None);
    }

    match bincode::deserialize(&body) {
        Ok(record) => Ok(Some((record, total_len as u64))),
        Err(_) => Ok(None),
    }
}
