//! Disk manager for page-level file I/O.

use lstore_buffer::PageStore;
use lstore_common::page::{PageId, PageKind, PAGE_SIZE};
use lstore_common::{LStoreError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// One column segment of a page range: all pages sharing a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SegmentKey {
    table_id: u32,
    range_id: u32,
    kind: PageKind,
    column: u16,
}

impl From<PageId> for SegmentKey {
    fn from(page_id: PageId) -> Self {
        Self {
            table_id: page_id.table_id,
            range_id: page_id.range_id,
            kind: page_id.kind,
            column: page_id.column,
        }
    }
}

/// Manages reading and writing pages to disk files.
///
/// Each (table, range, kind, column) segment maps to its own data file under
/// `t{table}/r{range}/`, with page `n` at byte offset `n * PAGE_SIZE`.
/// Every open file has its own lock, so I/O on different segments runs in
/// parallel.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open file handles keyed by segment.
    files: RwLock<HashMap<SegmentKey, Arc<Mutex<FileHandle>>>>,
}

/// Handle for an open data file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Directory holding every segment of a table.
    pub fn table_dir(&self, table_id: u32) -> PathBuf {
        self.config.data_dir.join(format!("t{:04}", table_id))
    }

    /// Generates the file path for a segment.
    fn file_path(&self, key: SegmentKey) -> PathBuf {
        let prefix = match key.kind {
            PageKind::Base => 'b',
            PageKind::Tail => 't',
        };
        self.table_dir(key.table_id)
            .join(format!("r{:06}", key.range_id))
            .join(format!("{}{:03}.dat", prefix, key.column))
    }

    /// Returns the open handle of a segment, opening the file if needed.
    ///
    /// With `create` unset a missing file yields `Ok(None)`.
    fn handle(&self, key: SegmentKey, create: bool) -> Result<Option<Arc<Mutex<FileHandle>>>> {
        if let Some(handle) = self.files.read().get(&key) {
            return Ok(Some(Arc::clone(handle)));
        }

        let mut files = self.files.write();
        if let Some(handle) = files.get(&key) {
            return Ok(Some(Arc::clone(handle)));
        }

        let path = self.file_path(key);
        if !create && !path.exists() {
            return Ok(None);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;
        let handle = Arc::new(Mutex::new(FileHandle { file, num_pages }));
        files.insert(key, Arc::clone(&handle));
        Ok(Some(handle))
    }

    /// Runs `f` on a segment's file under that file's lock only.
    fn with_file<T>(
        &self,
        key: SegmentKey,
        create: bool,
        f: impl FnOnce(&mut FileHandle) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.handle(key, create)? {
            Some(handle) => f(&mut handle.lock()).map(Some),
            None => Ok(None),
        }
    }

    /// Reads a page from disk.
    ///
    /// Pages past the end of the segment, and zero-filled holes left by
    /// writing a later page first, do not exist.
    pub fn read_page(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        let not_found = LStoreError::PageNotFound { page_id };

        let page = self.with_file(page_id.into(), false, |handle| {
            if page_id.page_num >= handle.num_pages {
                return Ok(None);
            }

            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;

            let mut buffer = Box::new([0u8; PAGE_SIZE]);
            handle.file.read_exact(&mut buffer[..])?;

            if buffer.iter().all(|&b| b == 0) {
                return Ok(None);
            }
            Ok(Some(buffer))
        })?;

        page.flatten().ok_or(not_found)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(LStoreError::InvalidParameter {
                name: "page length".to_string(),
                value: data.len().to_string(),
            });
        }

        let fsync = self.config.fsync_enabled;
        self.with_file(page_id.into(), true, |handle| {
            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(data)?;

            if fsync {
                handle.file.sync_data()?;
            }

            // Update page count if we extended the file
            if page_id.page_num >= handle.num_pages {
                handle.num_pages = page_id.page_num + 1;
            }
            Ok(())
        })?;

        Ok(())
    }

    /// Returns the number of page slots in the segment containing `page_id`.
    pub fn num_pages(&self, page_id: PageId) -> Result<u32> {
        Ok(self
            .with_file(page_id.into(), false, |handle| Ok(handle.num_pages))?
            .unwrap_or(0))
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let handles: Vec<_> = self.files.read().values().cloned().collect();
        for handle in handles {
            handle.lock().file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let handles: Vec<_> = self.files.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.lock().file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes every data file of a table.
    pub fn delete_table(&self, table_id: u32) -> Result<()> {
        self.files.write().retain(|key, _| key.table_id != table_id);
        let dir = self.table_dir(table_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

impl PageStore for DiskManager {
    fn load(&self, page_id: PageId) -> Result<Vec<u8>> {
        Ok(self.read_page(page_id)?.to_vec())
    }

    fn store(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.write_page(page_id, data)
    }

    fn exists(&self, page_id: PageId) -> Result<bool> {
        match self.read_page(page_id) {
            Ok(_) => Ok(true),
            Err(LStoreError::PageNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn sync(&self) -> Result<()> {
        self.flush()
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager")
            .field("data_dir", &self.config.data_dir)
            .field("open_files", &self.files.read().len())
            .finish()
    }
}
