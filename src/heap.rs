//! The slotted-page heap record manager.
//!
//! A heap file stores fixed-width records. Page 0 holds the file header;
//! data pages carry a used-slot bitmap and a fixed-stride slot array. Pages
//! with at least one free slot form an intrusive singly-linked free list
//! rooted in the file header (page number 0 terminates it, since page 0 is
//! never a data page).

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::buffer_pool::BufferPoolManager;
use crate::errors::{DbError, Result};
use crate::transaction::{Context, WriteRecord};
use crate::wal::LogRecord;
use crate::{FileId, PageId, PageNo, Rid, INVALID_LSN, PAGE_SIZE};

const NO_PAGE: PageNo = 0;

/// Byte offsets shared by all pages: the page LSN occupies [0, 8).
const FILE_HDR_RECORD_SIZE: usize = 8;
const FILE_HDR_SLOTS_PER_PAGE: usize = 12;
const FILE_HDR_FIRST_FREE_PAGE: usize = 16;
const FILE_HDR_NUM_PAGES: usize = 20;

const PAGE_HDR_NEXT_FREE: usize = 8;
const PAGE_HDR_NUM_RECORDS: usize = 12;
const PAGE_HDR_BITMAP: usize = 16;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn bitmap_get(data: &[u8], slot: usize) -> bool {
    data[PAGE_HDR_BITMAP + slot / 8] & (1 << (slot % 8)) != 0
}

fn bitmap_set(data: &mut [u8], slot: usize) {
    data[PAGE_HDR_BITMAP + slot / 8] |= 1 << (slot % 8);
}

fn bitmap_clear(data: &mut [u8], slot: usize) {
    data[PAGE_HDR_BITMAP + slot / 8] &= !(1 << (slot % 8));
}

/// Bitmap bytes for `slots` slots, zero-padded to 8-byte alignment.
fn bitmap_len(slots: usize) -> usize {
    slots.div_ceil(8).div_ceil(8) * 8
}

/// The largest slot count whose bitmap and slot array fit one page.
fn slots_per_page(record_size: usize) -> usize {
    let available = PAGE_SIZE - PAGE_HDR_BITMAP;
    let mut slots = (available * 8) / (1 + 8 * record_size);
    while slots > 0 && PAGE_HDR_BITMAP + bitmap_len(slots) + slots * record_size > PAGE_SIZE {
        slots -= 1;
    }
    slots
}

#[derive(Debug, Clone, Copy)]
struct HeapFileHeader {
    record_size: u32,
    slots_per_page: u32,
    first_free_page: PageNo,
    num_pages: u32,
}

impl HeapFileHeader {
    fn read(data: &[u8]) -> Self {
        Self {
            record_size: read_u32(data, FILE_HDR_RECORD_SIZE),
            slots_per_page: read_u32(data, FILE_HDR_SLOTS_PER_PAGE),
            first_free_page: read_u32(data, FILE_HDR_FIRST_FREE_PAGE),
            num_pages: read_u32(data, FILE_HDR_NUM_PAGES),
        }
    }

    fn write(&self, data: &mut [u8]) {
        write_u32(data, FILE_HDR_RECORD_SIZE, self.record_size);
        write_u32(data, FILE_HDR_SLOTS_PER_PAGE, self.slots_per_page);
        write_u32(data, FILE_HDR_FIRST_FREE_PAGE, self.first_free_page);
        write_u32(data, FILE_HDR_NUM_PAGES, self.num_pages);
    }
}

/// A fixed-width-record heap file.
pub struct HeapFile {
    name: String,
    fd: FileId,
    bpm: Arc<BufferPoolManager>,
    header: Mutex<HeapFileHeader>,
}

impl HeapFile {
    /// Creates the file on disk with its header page and opens it.
    pub fn create<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        record_size: usize,
        bpm: Arc<BufferPoolManager>,
    ) -> Result<Self> {
        let slots = slots_per_page(record_size);
        if slots == 0 {
            return Err(DbError::internal(format!(
                "record size {record_size} does not fit a page"
            )));
        }
        bpm.disk().create_file(path.as_ref())?;
        let fd = bpm.disk().open_file(path.as_ref())?;
        let header = HeapFileHeader {
            record_size: record_size as u32,
            slots_per_page: slots as u32,
            first_free_page: NO_PAGE,
            num_pages: 1,
        };
        let heap = Self {
            name: name.into(),
            fd,
            bpm,
            header: Mutex::new(header),
        };
        heap.write_header(&header)?;
        heap.bpm.flush_page(PageId { fd, page_no: 0 })?;
        Ok(heap)
    }

    /// Opens an existing heap file and caches its header.
    pub fn open<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        bpm: Arc<BufferPoolManager>,
    ) -> Result<Self> {
        let fd = bpm.disk().open_file(path.as_ref())?;
        let header = {
            let guard = bpm.fetch_page(PageId { fd, page_no: 0 })?;
            let page = guard.read();
            HeapFileHeader::read(&page.data)
        };
        Ok(Self {
            name: name.into(),
            fd,
            bpm,
            header: Mutex::new(header),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn record_size(&self) -> usize {
        self.header.lock().unwrap().record_size as usize
    }

    pub fn num_pages(&self) -> u32 {
        self.header.lock().unwrap().num_pages
    }

    fn write_header(&self, header: &HeapFileHeader) -> Result<()> {
        let guard = self.bpm.fetch_page(PageId {
            fd: self.fd,
            page_no: 0,
        })?;
        header.write(&mut guard.write().data);
        Ok(())
    }

    fn slot_offset(&self, header: &HeapFileHeader, slot: usize) -> usize {
        PAGE_HDR_BITMAP + bitmap_len(header.slots_per_page as usize)
            + slot * header.record_size as usize
    }

    /// Inserts into the first free-listed page, allocating (and logging) a new
    /// page when the list is empty. Returns the record's Rid.
    pub fn insert_record(&self, data: &[u8], ctx: &mut Context<'_>) -> Result<Rid> {
        if let (Some(lock_mgr), Some(txn)) = (ctx.lock_mgr, ctx.txn.as_deref_mut()) {
            lock_mgr.lock_ix_on_table(txn, self.fd)?;
        }

        let mut header = self.header.lock().unwrap();
        if data.len() != header.record_size as usize {
            return Err(DbError::internal(format!(
                "record length {} != record size {}",
                data.len(),
                header.record_size
            )));
        }

        let page_no = if header.first_free_page == NO_PAGE {
            let page_no = self.allocate_data_page(&mut header, ctx)?;
            header.first_free_page = page_no;
            self.write_header(&header)?;
            page_no
        } else {
            header.first_free_page
        };

        let guard = self.bpm.fetch_page(PageId {
            fd: self.fd,
            page_no,
        })?;
        let slots = header.slots_per_page as usize;
        let slot_no = {
            let page = guard.read();
            (0..slots)
                .find(|&s| !bitmap_get(&page.data, s))
                .ok_or_else(|| DbError::internal(format!("free-listed page {page_no} is full")))?
        };
        let rid = Rid {
            page_no,
            slot_no: slot_no as u32,
        };

        if let (Some(lock_mgr), Some(txn)) = (ctx.lock_mgr, ctx.txn.as_deref_mut()) {
            lock_mgr.lock_exclusive_on_record(txn, rid, self.fd)?;
        }

        let lsn = self.log_write(ctx, |prev_lsn, txn_id| LogRecord::Insert {
            lsn: INVALID_LSN,
            prev_lsn,
            txn_id,
            table: self.name.clone(),
            rid,
            value: data.to_vec(),
        })?;

        {
            let mut page = guard.write();
            bitmap_set(&mut page.data, slot_no);
            let num_records = read_u32(&page.data, PAGE_HDR_NUM_RECORDS) + 1;
            write_u32(&mut page.data, PAGE_HDR_NUM_RECORDS, num_records);
            let offset = self.slot_offset(&header, slot_no);
            page.data[offset..offset + data.len()].copy_from_slice(data);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }

            // The page just filled up: unlink it from the free list.
            if num_records == header.slots_per_page {
                header.first_free_page = read_u32(&page.data, PAGE_HDR_NEXT_FREE);
                write_u32(&mut page.data, PAGE_HDR_NEXT_FREE, NO_PAGE);
            }
        }
        if header.first_free_page != page_no {
            self.write_header(&header)?;
        }

        if let Some(txn) = ctx.txn.as_deref_mut() {
            txn.append_write_record(WriteRecord::TableInsert {
                table: self.name.clone(),
                rid,
            });
        }
        Ok(rid)
    }

    /// Removes the record, returning its payload. The page rejoins the free
    /// list when it transitions from full.
    pub fn delete_record(&self, rid: Rid, ctx: &mut Context<'_>) -> Result<Vec<u8>> {
        self.lock_for_write(rid, ctx)?;
        let mut header = self.header.lock().unwrap();
        let guard = self.bpm.fetch_page(PageId {
            fd: self.fd,
            page_no: rid.page_no,
        })?;

        let old = {
            let page = guard.read();
            if !bitmap_get(&page.data, rid.slot_no as usize) {
                return Err(DbError::internal(format!("no record at {rid:?}")));
            }
            let offset = self.slot_offset(&header, rid.slot_no as usize);
            page.data[offset..offset + header.record_size as usize].to_vec()
        };

        let lsn = self.log_write(ctx, |prev_lsn, txn_id| LogRecord::Delete {
            lsn: INVALID_LSN,
            prev_lsn,
            txn_id,
            table: self.name.clone(),
            rid,
            value: old.clone(),
        })?;

        {
            let mut page = guard.write();
            bitmap_clear(&mut page.data, rid.slot_no as usize);
            let num_records = read_u32(&page.data, PAGE_HDR_NUM_RECORDS) - 1;
            write_u32(&mut page.data, PAGE_HDR_NUM_RECORDS, num_records);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }

            // Full → has-free: push onto the free list head.
            if num_records + 1 == header.slots_per_page {
                write_u32(&mut page.data, PAGE_HDR_NEXT_FREE, header.first_free_page);
                header.first_free_page = rid.page_no;
                self.write_header(&header)?;
            }
        }

        if let Some(txn) = ctx.txn.as_deref_mut() {
            txn.append_write_record(WriteRecord::TableDelete {
                table: self.name.clone(),
                rid,
                value: old.clone(),
            });
        }
        Ok(old)
    }

    /// Overwrites the record in place (fixed record width).
    pub fn update_record(&self, rid: Rid, data: &[u8], ctx: &mut Context<'_>) -> Result<()> {
        self.lock_for_write(rid, ctx)?;
        let header = self.header.lock().unwrap();
        if data.len() != header.record_size as usize {
            return Err(DbError::internal(format!(
                "record length {} != record size {}",
                data.len(),
                header.record_size
            )));
        }
        let guard = self.bpm.fetch_page(PageId {
            fd: self.fd,
            page_no: rid.page_no,
        })?;

        let old = {
            let page = guard.read();
            if !bitmap_get(&page.data, rid.slot_no as usize) {
                return Err(DbError::internal(format!("no record at {rid:?}")));
            }
            let offset = self.slot_offset(&header, rid.slot_no as usize);
            page.data[offset..offset + header.record_size as usize].to_vec()
        };

        let lsn = self.log_write(ctx, |prev_lsn, txn_id| LogRecord::Update {
            lsn: INVALID_LSN,
            prev_lsn,
            txn_id,
            table: self.name.clone(),
            rid,
            old_value: old.clone(),
            new_value: data.to_vec(),
        })?;

        {
            let mut page = guard.write();
            let offset = self.slot_offset(&header, rid.slot_no as usize);
            page.data[offset..offset + data.len()].copy_from_slice(data);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }
        }

        if let Some(txn) = ctx.txn.as_deref_mut() {
            txn.append_write_record(WriteRecord::TableUpdate {
                table: self.name.clone(),
                rid,
                old_value: old,
            });
        }
        Ok(())
    }

    /// Copies out the record payload.
    pub fn get_record(&self, rid: Rid, ctx: &mut Context<'_>) -> Result<Vec<u8>> {
        if let (Some(lock_mgr), Some(txn)) = (ctx.lock_mgr, ctx.txn.as_deref_mut()) {
            lock_mgr.lock_is_on_table(txn, self.fd)?;
            lock_mgr.lock_shared_on_record(txn, rid, self.fd)?;
        }
        let header = self.header.lock().unwrap();
        let guard = self.bpm.fetch_page(PageId {
            fd: self.fd,
            page_no: rid.page_no,
        })?;
        let page = guard.read();
        if !bitmap_get(&page.data, rid.slot_no as usize) {
            return Err(DbError::internal(format!("no record at {rid:?}")));
        }
        let offset = self.slot_offset(&header, rid.slot_no as usize);
        Ok(page.data[offset..offset + header.record_size as usize].to_vec())
    }

    /// Places a record at an exact Rid, materializing missing pages. Used by
    /// redo and by undo of deletes; idempotent over an occupied slot.
    pub fn insert_record_at(&self, rid: Rid, data: &[u8]) -> Result<()> {
        let mut header = self.header.lock().unwrap();
        let guard = self.bpm.fetch_or_create_page(PageId {
            fd: self.fd,
            page_no: rid.page_no,
        })?;
        {
            let mut page = guard.write();
            if !bitmap_get(&page.data, rid.slot_no as usize) {
                bitmap_set(&mut page.data, rid.slot_no as usize);
                let num_records = read_u32(&page.data, PAGE_HDR_NUM_RECORDS) + 1;
                write_u32(&mut page.data, PAGE_HDR_NUM_RECORDS, num_records);
            }
            let offset = self.slot_offset(&header, rid.slot_no as usize);
            page.data[offset..offset + data.len()].copy_from_slice(data);
        }
        if rid.page_no >= header.num_pages {
            header.num_pages = rid.page_no + 1;
            self.write_header(&header)?;
        }
        Ok(())
    }

    /// Clears a slot if set; tolerant counterpart of `delete_record` for
    /// redo/undo idempotence.
    pub fn delete_record_at(&self, rid: Rid) -> Result<()> {
        let mut header = self.header.lock().unwrap();
        let guard = self.bpm.fetch_or_create_page(PageId {
            fd: self.fd,
            page_no: rid.page_no,
        })?;
        let mut page = guard.write();
        if bitmap_get(&page.data, rid.slot_no as usize) {
            bitmap_clear(&mut page.data, rid.slot_no as usize);
            let num_records = read_u32(&page.data, PAGE_HDR_NUM_RECORDS) - 1;
            write_u32(&mut page.data, PAGE_HDR_NUM_RECORDS, num_records);
            if num_records + 1 == header.slots_per_page {
                write_u32(&mut page.data, PAGE_HDR_NEXT_FREE, header.first_free_page);
                header.first_free_page = rid.page_no;
                drop(page);
                self.write_header(&header)?;
            }
        }
        Ok(())
    }

    /// Overwrites a slot payload without locking or logging; marks the slot
    /// used so replaying against a fresh page succeeds.
    pub fn update_record_at(&self, rid: Rid, data: &[u8]) -> Result<()> {
        self.insert_record_at(rid, data)
    }

    /// All records in ascending (page_no, slot_no) order.
    pub fn scan(&self) -> HeapScan<'_> {
        let header = self.header.lock().unwrap();
        HeapScan {
            heap: self,
            page_no: 1,
            slot_no: 0,
            num_pages: header.num_pages,
            slots_per_page: header.slots_per_page,
            record_size: header.record_size as usize,
            data_start: PAGE_HDR_BITMAP + bitmap_len(header.slots_per_page as usize),
        }
    }

    fn lock_for_write(&self, rid: Rid, ctx: &mut Context<'_>) -> Result<()> {
        if let (Some(lock_mgr), Some(txn)) = (ctx.lock_mgr, ctx.txn.as_deref_mut()) {
            lock_mgr.lock_ix_on_table(txn, self.fd)?;
            lock_mgr.lock_exclusive_on_record(txn, rid, self.fd)?;
        }
        Ok(())
    }

    fn allocate_data_page(
        &self,
        header: &mut HeapFileHeader,
        ctx: &mut Context<'_>,
    ) -> Result<PageNo> {
        let guard = self.bpm.new_page(self.fd)?;
        let page_no = guard.page_id().page_no;
        header.num_pages = header.num_pages.max(page_no + 1);

        let lsn = self.log_write(ctx, |prev_lsn, txn_id| LogRecord::NewPage {
            lsn: INVALID_LSN,
            prev_lsn,
            txn_id,
            table: self.name.clone(),
            page_no,
        })?;
        let mut page = guard.write();
        write_u32(&mut page.data, PAGE_HDR_NEXT_FREE, NO_PAGE);
        write_u32(&mut page.data, PAGE_HDR_NUM_RECORDS, 0);
        if let Some(lsn) = lsn {
            page.set_lsn(lsn);
        }
        crate::basalt_debug_log!("[HeapFile::{}] allocated data page {page_no}", self.name);
        Ok(page_no)
    }

    fn log_write(
        &self,
        ctx: &mut Context<'_>,
        make: impl FnOnce(crate::Lsn, crate::TxnId) -> LogRecord,
    ) -> Result<Option<crate::Lsn>> {
        if let (Some(log_mgr), Some(txn)) = (ctx.log_mgr, ctx.txn.as_deref_mut()) {
            let mut record = make(txn.prev_lsn(), txn.id());
            let lsn = log_mgr.add_log_to_buffer(&mut record)?;
            txn.set_prev_lsn(lsn);
            Ok(Some(lsn))
        } else {
            Ok(None)
        }
    }
}

/// Iterator over every live record of a heap file.
///
/// Snapshots the page count at creation: concurrent updates to visited slots
/// are tolerated, structural changes are not.
pub struct HeapScan<'a> {
    heap: &'a HeapFile,
    page_no: PageNo,
    slot_no: u32,
    num_pages: u32,
    slots_per_page: u32,
    record_size: usize,
    data_start: usize,
}

impl Iterator for HeapScan<'_> {
    type Item = Result<(Rid, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.page_no < self.num_pages {
            let guard = match self.heap.bpm.fetch_page(PageId {
                fd: self.heap.fd,
                page_no: self.page_no,
            }) {
                Ok(guard) => guard,
                Err(e) => return Some(Err(e)),
            };
            let page = guard.read();
            while self.slot_no < self.slots_per_page {
                let slot = self.slot_no as usize;
                self.slot_no += 1;
                if bitmap_get(&page.data, slot) {
                    let offset = self.data_start + slot * self.record_size;
                    let payload = page.data[offset..offset + self.record_size].to_vec();
                    let rid = Rid {
                        page_no: self.page_no,
                        slot_no: slot as u32,
                    };
                    return Some(Ok((rid, payload)));
                }
            }
            self.page_no += 1;
            self.slot_no = 0;
        }
        None
    }
}
