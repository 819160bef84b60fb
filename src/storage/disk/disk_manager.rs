use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{PageNumber, Result};

/// DiskManager reads and writes whole pages of the main database file.
/// Page N lives at byte offset (N - 1) * page_size.
pub struct DiskManager {
    /// The database file, possibly shared with other connections of this
    /// process
    db_file: Arc<Mutex<File>>,
    /// Path to the database file
    db_path: PathBuf,
    page_size: usize,
    /// Number of disk reads performed
    num_reads: AtomicU32,
    /// Number of disk writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (creating if needed) the database file at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path.as_ref())?;
        Ok(Self::with_shared_file(Arc::new(Mutex::new(file)), db_path, page_size))
    }

    /// Uses an already open handle on the database file. Every seek and
    /// transfer happens under the handle's mutex, so the handle may be
    /// shared between managers.
    pub fn with_shared_file<P: AsRef<Path>>(file: Arc<Mutex<File>>, db_path: P, page_size: usize) -> Self {
        Self {
            db_file: file,
            db_path: db_path.as_ref().to_path_buf(),
            page_size,
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        }
    }

    /// Reads a page from disk into the provided buffer.
    /// A page that is missing or cut short on disk is an `UnexpectedEof` I/O error.
    pub fn read_page(&self, pgno: PageNumber, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), self.page_size, "Buffer must be page_size bytes");

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(pgno.file_offset(self.page_size)))?;
        file.read_exact(data).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("short read of page {}", pgno.as_u32()),
                )
            } else {
                e
            }
        })?;

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer.
    pub fn write_page(&self, pgno: PageNumber, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), self.page_size, "Buffer must be page_size bytes");

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(pgno.file_offset(self.page_size)))?;
        file.write_all(data)?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset`, returning how many were available.
    /// Used for the database header, which may be probed before the page size is known.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Returns the file size in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.db_file.lock().metadata()?.len())
    }

    /// Number of whole pages currently in the file.
    pub fn file_pages(&self) -> Result<u32> {
        Ok((self.file_size()? / self.page_size as u64) as u32)
    }

    /// Truncates the file to exactly `pages` pages.
    pub fn truncate_pages(&self, pages: u32) -> Result<()> {
        let file = self.db_file.lock();
        file.set_len(pages as u64 * self.page_size as u64)?;
        Ok(())
    }

    /// Returns the page size this manager was opened with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of disk reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of disk writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// Returns the path to the database file.
    pub fn get_db_path(&self) -> &Path {
        &self.db_path
    }

    /// Flushes written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        let file = self.db_file.lock();
        file.sync_all()?;
        Ok(())
    }
}

/// Path of a file kept next to the database, e.g. `<db>-wal`.
pub fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
