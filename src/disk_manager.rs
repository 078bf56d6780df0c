use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::errors::Result;
use crate::{FileId, PageNo, PAGE_SIZE};

struct FileState {
    file: File,
    path: PathBuf,
    next_page_no: PageNo,
}

/// Owns every open paged file plus the append-only log file.
///
/// All page I/O is exactly [`PAGE_SIZE`] bytes. Page numbers are allocated
/// strictly increasing per file; page 0 is reserved for the file header.
pub struct DiskManager {
    files: Mutex<HashMap<FileId, FileState>>,
    next_fd: AtomicU32,
    log_file: Mutex<File>,
}

impl DiskManager {
    /// Opens the manager with its log file at `log_path`, creating it if absent.
    pub fn new<P: AsRef<Path>>(log_path: P) -> Result<Self> {
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(log_path.as_ref())?;
        Ok(Self {
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicU32::new(0),
            log_file: Mutex::new(log_file),
        })
    }

    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {path:?}"),
            )
            .into());
        }
        File::create(path)?;
        Ok(())
    }

    pub fn destroy_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let files = self.files.lock().unwrap();
        if files.values().any(|state| state.path == path) {
            return Err(io::Error::other(format!("cannot destroy open file: {path:?}")).into());
        }
        drop(files);
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<FileId> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let file_size = file.metadata()?.len();
        // Page 0 is the header page, so allocation starts at 1 even for a
        // freshly created empty file.
        let next_page_no = ((file_size / PAGE_SIZE as u64) as PageNo).max(1);
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        crate::basalt_debug_log!(
            "[DiskManager::open_file] {path:?} -> fd {fd}, next_page_no {next_page_no}"
        );
        self.files.lock().unwrap().insert(
            fd,
            FileState {
                file,
                path: path.to_path_buf(),
                next_page_no,
            },
        );
        Ok(fd)
    }

    pub fn close_file(&self, fd: FileId) -> Result<()> {
        if let Some(state) = self.files.lock().unwrap().remove(&fd) {
            state.file.sync_all()?;
        }
        Ok(())
    }

    pub fn is_open(&self, fd: FileId) -> bool {
        self.files.lock().unwrap().contains_key(&fd)
    }

    /// Reads one page. Short reads (a page allocated but never written) come
    /// back zero-filled.
    pub fn read_page(&self, fd: FileId, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut files = self.files.lock().unwrap();
        let state = file_state(&mut files, fd)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match state.file.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        if total < buf.len() {
            buf[total..].fill(0);
        }
        Ok(())
    }

    pub fn write_page(&self, fd: FileId, page_no: PageNo, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut files = self.files.lock().unwrap();
        let state = file_state(&mut files, fd)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(buf)?;
        state.file.sync_all()?;
        if page_no >= state.next_page_no {
            state.next_page_no = page_no + 1;
        }
        Ok(())
    }

    /// Allocates the next page number for `fd`. Strictly increasing; never 0.
    pub fn allocate_page(&self, fd: FileId) -> Result<PageNo> {
        let mut files = self.files.lock().unwrap();
        let state = file_state(&mut files, fd)?;
        let page_no = state.next_page_no;
        state.next_page_no += 1;
        crate::basalt_debug_log!("[DiskManager::allocate_page] fd {fd} -> page {page_no}");
        Ok(page_no)
    }

    /// Whether `page_no` has ever reached disk for this file.
    pub fn is_flushed(&self, fd: FileId, page_no: PageNo) -> Result<bool> {
        let mut files = self.files.lock().unwrap();
        let state = file_state(&mut files, fd)?;
        let flushed_pages = state.file.metadata()?.len() / PAGE_SIZE as u64;
        Ok((page_no as u64) < flushed_pages)
    }

    /// Appends raw bytes to the log file and syncs.
    pub fn append_log(&self, bytes: &[u8]) -> Result<()> {
        let mut log = self.log_file.lock().unwrap();
        log.seek(SeekFrom::End(0))?;
        log.write_all(bytes)?;
        log.sync_all()?;
        Ok(())
    }

    /// Reads up to `buf.len()` log bytes starting at `offset`; returns the
    /// number of bytes read (0 at end of log).
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut log = self.log_file.lock().unwrap();
        let log_len = log.metadata()?.len();
        if offset >= log_len {
            return Ok(0);
        }
        log.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match log.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }

    pub fn log_len(&self) -> Result<u64> {
        Ok(self.log_file.lock().unwrap().metadata()?.len())
    }
}

fn file_state<'a>(
    files: &'a mut HashMap<FileId, FileState>,
    fd: FileId,
) -> Result<&'a mut FileState> {
    files.get_mut(&fd).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("file handle {fd} is not open")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_round_trip_survives_reopen() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("test.tbl");
        let dm = DiskManager::new(dir.path().join("test.log")).unwrap();

        dm.create_file(&data_path).unwrap();
        let fd = dm.open_file(&data_path).unwrap();

        let page_no = dm.allocate_page(fd).unwrap();
        assert_eq!(page_no, 1);

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(fd, page_no, &page).unwrap();
        dm.close_file(fd).unwrap();

        let fd = dm.open_file(&data_path).unwrap();
        let mut read_back = vec![0u8; PAGE_SIZE];
        dm.read_page(fd, page_no, &mut read_back).unwrap();
        assert_eq!(read_back, page);
        // Allocation resumes past the flushed pages.
        assert_eq!(dm.allocate_page(fd).unwrap(), 2);
    }

    #[test]
    fn unwritten_page_reads_back_zeroed() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("test.tbl");
        let dm = DiskManager::new(dir.path().join("test.log")).unwrap();
        dm.create_file(&data_path).unwrap();
        let fd = dm.open_file(&data_path).unwrap();

        let page_no = dm.allocate_page(fd).unwrap();
        assert!(!dm.is_flushed(fd, page_no).unwrap());
        let mut buf = vec![0xFFu8; PAGE_SIZE];
        dm.read_page(fd, page_no, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn log_append_and_read_at_offset() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new(dir.path().join("test.log")).unwrap();

        dm.append_log(b"hello ").unwrap();
        dm.append_log(b"world").unwrap();

        let mut buf = [0u8; 16];
        let n = dm.read_log(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        let n = dm.read_log(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");

        assert_eq!(dm.read_log(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn destroy_refuses_open_file() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("test.tbl");
        let dm = DiskManager::new(dir.path().join("test.log")).unwrap();
        dm.create_file(&data_path).unwrap();
        let fd = dm.open_file(&data_path).unwrap();

        assert!(dm.destroy_file(&data_path).is_err());
        dm.close_file(fd).unwrap();
        dm.destroy_file(&data_path).unwrap();
        assert!(!data_path.exists());
    }
}
