//! Manages the buffer pool, a fixed set of in-memory frames caching disk pages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk_manager::DiskManager;
use crate::errors::{DbError, Result};
use crate::replacer::LruReplacer;
use crate::wal::LogManager;
use crate::{FileId, Lsn, PageId, PAGE_SIZE};

/// An in-memory copy of one disk page. The first 8 bytes of `data` hold the
/// page LSN, the last log record applied to the page.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: [0; PAGE_SIZE],
        }
    }

    pub fn reset(&mut self, id: PageId) {
        self.id = id;
        self.data.fill(0);
    }

    pub fn lsn(&self) -> Lsn {
        Lsn::from_le_bytes(self.data[0..8].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[0..8].copy_from_slice(&lsn.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    const EMPTY: FrameMeta = FrameMeta {
        page_id: None,
        pin_count: 0,
        is_dirty: false,
    };
}

struct PoolState {
    page_table: HashMap<PageId, usize>,
    free_list: Vec<usize>,
    replacer: LruReplacer,
    meta: Vec<FrameMeta>,
}

/// The buffer pool manager.
///
/// Frame metadata, the page table, the free list and the replacer all live
/// under one mutex; page payloads sit in per-frame `RwLock`s so readers of
/// pinned pages do not serialize on the pool latch.
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Option<Arc<LogManager>>,
    frames: Vec<Arc<RwLock<Page>>>,
    state: Mutex<PoolState>,
}

/// An RAII guard over a pinned page; dropping it unpins.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame: Arc<RwLock<Page>>,
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.read()
    }

    /// Write access; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.bpm.mark_dirty(self.page_id);
        self.frame.write()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.page_id, false);
    }
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        disk: Arc<DiskManager>,
        log: Option<Arc<LogManager>>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(PageId { fd: 0, page_no: 0 }))));
            free_list.push(i);
        }
        // Pop order matches insertion order of the free list.
        free_list.reverse();
        Self {
            disk,
            log,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
                meta: vec![FrameMeta::EMPTY; pool_size],
            }),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Pins `page_id`, reading it from disk if it is not cached.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();

        if let Some(&idx) = state.page_table.get(&page_id) {
            state.meta[idx].pin_count += 1;
            state.replacer.pin(idx);
            return Ok(PageGuard {
                bpm: self,
                page_id,
                frame: self.frames[idx].clone(),
            });
        }

        let idx = self.acquire_frame(&mut state)?;
        {
            let mut page = self.frames[idx].write();
            page.reset(page_id);
            self.disk.read_page(page_id.fd, page_id.page_no, &mut page.data)?;
        }
        state.meta[idx] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            is_dirty: false,
        };
        state.page_table.insert(page_id, idx);
        state.replacer.pin(idx);
        crate::basalt_debug_log!("[BufferPool::fetch_page] {page_id:?} -> frame {idx}");
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame: self.frames[idx].clone(),
        })
    }

    /// Allocates a fresh page in `fd` and pins it, zero-initialized and dirty.
    pub fn new_page(&self, fd: FileId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        let idx = self.acquire_frame(&mut state)?;
        let page_no = self.disk.allocate_page(fd)?;
        let page_id = PageId { fd, page_no };

        self.frames[idx].write().reset(page_id);
        state.meta[idx] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            is_dirty: true,
        };
        state.page_table.insert(page_id, idx);
        state.replacer.pin(idx);
        crate::basalt_debug_log!("[BufferPool::new_page] {page_id:?} -> frame {idx}");
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame: self.frames[idx].clone(),
        })
    }

    /// Pins an existing page by number, or creates it if the file has not
    /// allocated that far yet (used by recovery to rebuild lost pages).
    pub fn fetch_or_create_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        loop {
            if self.disk.is_flushed(page_id.fd, page_id.page_no)?
                || self.state.lock().unwrap().page_table.contains_key(&page_id)
            {
                return self.fetch_page(page_id);
            }
            let guard = self.new_page(page_id.fd)?;
            if guard.page_id() == page_id {
                return Ok(guard);
            }
            // Keep allocating until the target page number exists; the
            // intermediate guards flush zeroed pages on eviction.
            self.flush_page(guard.page_id())?;
        }
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.page_table.get(&page_id) {
            let pins_left = {
                let meta = &mut state.meta[idx];
                if meta.pin_count > 0 {
                    meta.pin_count -= 1;
                }
                if is_dirty {
                    meta.is_dirty = true;
                }
                meta.pin_count
            };
            if pins_left == 0 {
                state.replacer.unpin(idx);
            }
        }
    }

    fn mark_dirty(&self, page_id: PageId) {
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.page_table.get(&page_id) {
            state.meta[idx].is_dirty = true;
        }
    }

    /// Writes the page through to disk and clears its dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.page_table.get(&page_id) {
            self.write_back(idx)?;
            state.meta[idx].is_dirty = false;
        }
        Ok(())
    }

    pub fn flush_all_pages(&self, fd: FileId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<usize> = state
            .page_table
            .iter()
            .filter(|(page_id, _)| page_id.fd == fd)
            .map(|(_, &idx)| idx)
            .collect();
        for idx in targets {
            self.write_back(idx)?;
            state.meta[idx].is_dirty = false;
        }
        Ok(())
    }

    /// Drops the page from the pool, returning its frame to the free list.
    /// Fails while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(&idx) = state.page_table.get(&page_id) else {
            return Ok(());
        };
        if state.meta[idx].pin_count > 0 {
            return Err(DbError::internal(format!(
                "delete_page: {page_id:?} is still pinned"
            )));
        }
        state.page_table.remove(&page_id);
        state.replacer.pin(idx);
        state.meta[idx] = FrameMeta::EMPTY;
        state.free_list.push(idx);
        Ok(())
    }

    /// Drops every cached page of `fd` regardless of pin counts; used when a
    /// file is closed or destroyed.
    pub fn delete_all_pages(&self, fd: FileId) {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<(PageId, usize)> = state
            .page_table
            .iter()
            .filter(|(page_id, _)| page_id.fd == fd)
            .map(|(&page_id, &idx)| (page_id, idx))
            .collect();
        for (page_id, idx) in targets {
            state.page_table.remove(&page_id);
            state.replacer.pin(idx);
            state.meta[idx] = FrameMeta::EMPTY;
            state.free_list.push(idx);
        }
    }

    /// Current pin count of a cached page, if resident.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.page_table.get(&page_id).map(|&idx| state.meta[idx].pin_count)
    }

    fn acquire_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<usize> {
        if let Some(idx) = state.free_list.pop() {
            return Ok(idx);
        }
        let idx = state
            .replacer
            .victim()
            .ok_or_else(|| DbError::internal("buffer pool: no frame available, all pages pinned"))?;
        if let Some(old_page_id) = state.meta[idx].page_id {
            if state.meta[idx].is_dirty {
                self.write_back(idx)?;
            }
            state.page_table.remove(&old_page_id);
            crate::basalt_debug_log!("[BufferPool::acquire_frame] evicted {old_page_id:?}");
        }
        state.meta[idx] = FrameMeta::EMPTY;
        Ok(idx)
    }

    /// Writes one frame back to disk, flushing the log first when the page's
    /// LSN runs ahead of the persisted watermark (write-ahead rule).
    fn write_back(&self, idx: usize) -> Result<()> {
        let page = self.frames[idx].read();
        if let Some(log) = &self.log {
            if page.lsn() > log.persisted_lsn() {
                log.flush_log_to_disk()?;
            }
        }
        self.disk.write_page(page.id.fd, page.id.page_no, &page.data)?;
        Ok(())
    }
}
