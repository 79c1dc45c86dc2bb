//! Page file for page-level index file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tabula_common::{PageId, Result, TabulaError};

/// A single index file addressed in fixed-size pages.
///
/// Every read and write moves exactly one page. Writes go straight to the
/// file; `sync` makes them durable when fsync is enabled.
pub struct PageFile {
    path: PathBuf,
    page_size: usize,
    fsync_enabled: bool,
    handle: Mutex<FileHandle>,
}

struct FileHandle {
    file: File,
    num_pages: u32,
}

impl PageFile {
    /// Creates a new, empty page file. Fails if the file already exists.
    pub fn create(path: &Path, page_size: usize, fsync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            fsync_enabled,
            handle: Mutex::new(FileHandle { file, num_pages: 0 }),
        })
    }

    /// Opens an existing page file.
    pub fn open(path: &Path, page_size: usize, fsync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        if file_size % page_size as u64 != 0 {
            return Err(TabulaError::PageCorrupted {
                page_id: (file_size / page_size as u64) as u32,
                reason: format!("file size {} is not a multiple of {}", file_size, page_size),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            fsync_enabled,
            handle: Mutex::new(FileHandle {
                file,
                num_pages: (file_size / page_size as u64) as u32,
            }),
        })
    }

    /// Reads the first `len` bytes of a file without opening it as a page file.
    pub fn read_prefix(path: &Path, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(path)?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of pages in the file.
    pub fn num_pages(&self) -> u32 {
        self.handle.lock().num_pages
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<Box<[u8]>> {
        let mut handle = self.handle.lock();
        if page_id.0 >= handle.num_pages {
            return Err(TabulaError::PageNotFound { page_id: page_id.0 });
        }

        handle
            .file
            .seek(SeekFrom::Start(page_id.file_offset(self.page_size)))?;
        let mut buffer = vec![0u8; self.page_size].into_boxed_slice();
        handle.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes a page to disk, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(TabulaError::invalid("page image length", data.len()));
        }

        let mut handle = self.handle.lock();
        handle
            .file
            .seek(SeekFrom::Start(page_id.file_offset(self.page_size)))?;
        handle.file.write_all(data)?;

        if page_id.0 >= handle.num_pages {
            handle.num_pages = page_id.0 + 1;
        }
        Ok(())
    }

    /// Cuts the file down to `num_pages` pages.
    pub fn truncate(&self, num_pages: u32) -> Result<()> {
        let mut handle = self.handle.lock();
        handle
            .file
            .set_len(PageId(num_pages).file_offset(self.page_size))?;
        handle.num_pages = num_pages;
        Ok(())
    }

    /// Flushes written pages to stable storage when fsync is enabled.
    pub fn sync(&self) -> Result<()> {
        if self.fsync_enabled {
            self.handle.lock().file.sync_all()?;
        }
        Ok(())
    }
}
