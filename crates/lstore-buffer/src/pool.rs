//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::replacer::{LfuReplacer, Replacer};
use crate::store::PageStore;
use lstore_common::config::{StorageConfig, TieBreak};
use lstore_common::page::{PageHeader, PageId, PAGE_SIZE};
use lstore_common::{LStoreError, Result};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Tie-break rule for the default replacer.
    pub tie_break: TieBreak,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            tie_break: TieBreak::default(),
        }
    }
}

impl From<&StorageConfig> for BufferPoolConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            num_frames: config.buffer_pool_pages,
            tie_break: config.tie_break,
        }
    }
}

/// Where a page missing from the read path ends up.
enum Placement {
    /// Another thread made the page resident meanwhile.
    Resident(FrameId),
    /// An empty frame to place the page in.
    Vacant(FrameId),
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping, read-locked for hits and write-locked for
///   loads and evictions so a pin never races an eviction
/// - Free frame list for new pages
/// - Pluggable replacement policy (LFU by default)
/// - Pin counting and dirty tracking; dirty pages are written back before
///   their frame is reused or discarded
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping.
    page_table: RwLock<HashMap<PageId, FrameId>>,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: Box<dyn Replacer>,
    /// Where page images are loaded from and written back to.
    store: Arc<dyn PageStore>,
    /// Logical clock stamped on every pin.
    clock: AtomicU64,
    /// Set once by `shutdown`.
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

impl BufferPool {
    /// Creates a new buffer pool using the LFU replacer.
    pub fn new(config: BufferPoolConfig, store: Arc<dyn PageStore>) -> Self {
        let replacer = Box::new(LfuReplacer::new(config.tie_break));
        Self::with_replacer(config, store, replacer)
    }

    /// Creates a new buffer pool with a custom replacement policy.
    pub fn with_replacer(
        config: BufferPoolConfig,
        store: Arc<dyn PageStore>,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // Popped from the back, so frame 0 is handed out first.
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: RwLock::new(HashMap::with_capacity(num_frames)),
            free_list: Mutex::new(free_list),
            replacer,
            store,
            clock: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.read().len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.read().contains_key(&page_id)
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let table = self.page_table.read();
        table
            .get(&page_id)
            .map(|fid| self.frames[fid.0 as usize].pin_count())
    }

    /// Returns the page store behind this pool.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Returns true once `shutdown` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(LStoreError::PoolClosed);
        }
        Ok(())
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &BufferFrame {
        &self.frames[frame_id.0 as usize]
    }

    /// Fetches a page, loading it from the store on a miss.
    ///
    /// The page is pinned before being returned; the caller must release it
    /// with `unpin_page` or use the `read_page`/`write_page` guards.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        self.fetch_or_load(page_id, None::<fn(&mut [u8])>)
    }

    /// Fetches a page, creating it when the store does not have it.
    ///
    /// `init` formats a created page before any other thread can see it, so
    /// concurrent first touches of one page agree on a single image.
    pub fn fetch_or_create_page<F>(&self, page_id: PageId, init: F) -> Result<&BufferFrame>
    where
        F: FnOnce(&mut [u8]),
    {
        self.fetch_or_load(page_id, Some(init))
    }

    fn fetch_or_load<F>(&self, page_id: PageId, init: Option<F>) -> Result<&BufferFrame>
    where
        F: FnOnce(&mut [u8]),
    {
        self.check_open()?;

        {
            let table = self.page_table.read();
            if let Some(&frame_id) = table.get(&page_id) {
                let frame = self.frame(frame_id);
                frame.pin(self.tick());
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
        }

        let (mut table, placement) = self.place(page_id)?;
        let frame_id = match placement {
            // Another thread loaded the page while we waited.
            Placement::Resident(frame_id) => {
                let frame = self.frame(frame_id);
                frame.pin(self.tick());
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
            Placement::Vacant(frame_id) => frame_id,
        };
        let frame = self.frame(frame_id);
        let loaded = self
            .store
            .load(page_id)
            .and_then(|data| PageHeader::verify(page_id, &data).map(|_| data));

        match (loaded, init) {
            (Ok(data), _) => {
                frame.copy_from(&data);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(page = %page_id, frame = %frame_id, "loaded page");
            }
            (Err(LStoreError::PageNotFound { .. }), Some(init)) => {
                init(&mut frame.write_data()[..]);
                frame.set_dirty(true);
                debug!(page = %page_id, frame = %frame_id, "created page");
            }
            (Err(e), _) => {
                self.free_list.lock().push(frame_id);
                return Err(e);
            }
        }

        frame.set_page_id(Some(page_id));
        frame.pin(self.tick());
        table.insert(page_id, frame_id);
        Ok(frame)
    }

    /// Creates a frame for a page that does not exist in the store yet.
    ///
    /// The frame is zeroed, dirty and pinned. If the page is already resident
    /// the existing frame is pinned and returned.
    pub fn new_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        self.check_open()?;

        let (mut table, placement) = self.place(page_id)?;
        let frame_id = match placement {
            Placement::Resident(frame_id) => {
                let frame = self.frame(frame_id);
                frame.pin(self.tick());
                return Ok(frame);
            }
            Placement::Vacant(frame_id) => frame_id,
        };
        let frame = self.frame(frame_id);
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.set_dirty(true);
        frame.pin(self.tick());
        table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Locks the page table exclusively with a place for `page_id`.
    ///
    /// Tries the free list first, then evicts. A dirty victim is held by the
    /// pool and written back with the table unlocked, so fetches of other
    /// pages do not wait on the store; the search then starts over.
    fn place(
        &self,
        page_id: PageId,
    ) -> Result<(RwLockWriteGuard<'_, HashMap<PageId, FrameId>>, Placement)> {
        loop {
            let mut table = self.page_table.write();
            if let Some(&frame_id) = table.get(&page_id) {
                return Ok((table, Placement::Resident(frame_id)));
            }
            if let Some(frame_id) = self.free_list.lock().pop() {
                return Ok((table, Placement::Vacant(frame_id)));
            }

            let victim_id = self
                .replacer
                .evict(&self.frames, &|frame| frame.pin_count() == 0)
                .ok_or(LStoreError::CapacityExceeded {
                    frames: self.frames.len(),
                })?;

            let frame = self.frame(victim_id);
            if let Some(old_page_id) = frame.page_id() {
                if frame.is_dirty() {
                    frame.hold();
                    drop(table);
                    let written = self.write_back(old_page_id, frame);
                    frame.unpin();
                    written?;
                    continue;
                }
                table.remove(&old_page_id);
                debug!(
                    page = %old_page_id,
                    frame = %victim_id,
                    visits = frame.visit_count(),
                    "evicted page"
                );
            }
            frame.reset();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok((table, Placement::Vacant(victim_id)));
        }
    }

    /// Stamps the checksum and writes a frame's page to the store.
    fn write_back(&self, page_id: PageId, frame: &BufferFrame) -> Result<()> {
        let mut data = frame.write_data();
        PageHeader::stamp_checksum(&mut data[..]);
        self.store.store(page_id, &data[..])?;
        frame.set_dirty(false);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unpins a page in the buffer pool and ORs in the dirty flag.
    ///
    /// Fails with `InvalidHandle` if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        self.check_open()?;

        let table = self.page_table.read();
        let frame_id = table
            .get(&page_id)
            .copied()
            .ok_or(LStoreError::InvalidHandle { page_id })?;
        let frame = self.frame(frame_id);

        frame.unpin().ok_or(LStoreError::InvalidHandle { page_id })?;
        // Evictions hold the table write lock, so the frame cannot be
        // reused before the dirty flag lands.
        if is_dirty {
            frame.set_dirty(true);
        }
        Ok(())
    }

    /// Returns a read guard for a page.
    pub fn read_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns a write guard for a page. The page is unpinned dirty on drop.
    pub fn write_page(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns a write guard for a page, creating it with `init` when the
    /// store does not have it.
    pub fn write_page_or_create<F>(&self, page_id: PageId, init: F) -> Result<PageWriteGuard<'_>>
    where
        F: FnOnce(&mut [u8]),
    {
        let frame = self.fetch_or_create_page(page_id, init)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Writes a resident dirty page to the store.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.check_open()?;

        let table = self.page_table.read();
        if let Some(&frame_id) = table.get(&page_id) {
            let frame = self.frame(frame_id);
            if frame.is_dirty() {
                self.write_back(page_id, frame)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Writes every dirty page to the store.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&self) -> Result<usize> {
        self.check_open()?;
        self.flush_resident()
    }

    fn flush_resident(&self) -> Result<usize> {
        // Held for the whole pass so no frame changes pages under us.
        let table = self.page_table.read();
        let mut resident: Vec<_> = table.iter().map(|(&pid, &fid)| (pid, fid)).collect();
        resident.sort();

        let mut flushed = 0;
        for (page_id, frame_id) in resident {
            let frame = self.frame(frame_id);
            if frame.is_dirty() {
                self.write_back(page_id, frame)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Drops a resident page from the pool, writing it back first if it is
    /// dirty.
    ///
    /// Returns false if the page is pinned. A page that is not resident
    /// counts as discarded.
    pub fn discard_page(&self, page_id: PageId) -> Result<bool> {
        self.check_open()?;

        loop {
            {
                let table = self.page_table.read();
                let Some(&frame_id) = table.get(&page_id) else {
                    return Ok(true);
                };
                let frame = self.frame(frame_id);
                if frame.is_pinned() {
                    return Ok(false);
                }
                if frame.is_dirty() {
                    self.write_back(page_id, frame)?;
                }
            }

            let mut table = self.page_table.write();
            let Some(&frame_id) = table.get(&page_id) else {
                return Ok(true);
            };
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                return Ok(false);
            }
            // Written again between the write-back and the table lock.
            if frame.is_dirty() {
                continue;
            }

            table.remove(&page_id);
            frame.reset();
            self.free_list.lock().push(frame_id);
            debug!(page = %page_id, "discarded page");
            return Ok(true);
        }
    }

    /// Drops every unpinned resident page matching `pred` without writing
    /// it back.
    ///
    /// Returns the number of pages dropped.
    pub fn discard_where(&self, pred: impl Fn(PageId) -> bool) -> Result<usize> {
        self.check_open()?;

        let mut table = self.page_table.write();
        let victims: Vec<_> = table
            .iter()
            .filter(|(pid, fid)| pred(**pid) && !self.frame(**fid).is_pinned())
            .map(|(&pid, &fid)| (pid, fid))
            .collect();

        let mut free_list = self.free_list.lock();
        for (page_id, frame_id) in &victims {
            table.remove(page_id);
            self.frame(*frame_id).reset();
            free_list.push(*frame_id);
        }
        Ok(victims.len())
    }

    /// Flushes every dirty page, syncs the store and releases all frames.
    ///
    /// Later calls on the pool fail with `PoolClosed`. Calling `shutdown`
    /// again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let flushed = self.flush_resident()?;
        self.store.sync()?;

        let mut table = self.page_table.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        table.clear();
        for frame in &self.frames {
            frame.reset();
        }
        let mut free_list = self.free_list.lock();
        free_list.clear();
        free_list.extend((0..self.frames.len()).rev().map(|i| FrameId(i as u32)));

        info!(flushed, "buffer pool shut down");
        Ok(())
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let table = self.page_table.read();
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        for frame_id in table.values() {
            let frame = self.frame(*frame_id);
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("num_frames", &self.config.num_frames)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
    /// Fetches served from a resident frame.
    pub hits: u64,
    /// Fetches that loaded the page from the store.
    pub misses: u64,
    /// Pages evicted to make room.
    pub evictions: u64,
    /// Pages written back to the store.
    pub flushes: u64,
}

/// RAII guard for reading a page.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard for writing a page.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageWriteGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }

    /// Returns mutable access to page data.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.write_data()
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.pool.unpin_page(self.page_id, true);
    }
}
