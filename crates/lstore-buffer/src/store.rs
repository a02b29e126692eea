//! Persistence collaborator behind the buffer pool.

use lstore_common::page::PageId;
use lstore_common::{LStoreError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable home of page images.
///
/// The buffer pool reads pages through `load` on a miss and writes dirty
/// pages back through `store` on eviction, flush, or shutdown.
pub trait PageStore: Send + Sync {
    /// Reads the full image of a page. Fails with `PageNotFound` if the page
    /// was never stored.
    fn load(&self, page_id: PageId) -> Result<Vec<u8>>;

    /// Writes the full image of a page.
    fn store(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Returns true if the page has been stored.
    fn exists(&self, page_id: PageId) -> Result<bool>;

    /// Makes every stored page durable.
    fn sync(&self) -> Result<()>;
}

/// Page store kept entirely in memory.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<PageId, Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryPageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pages.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns true if no page has been stored.
    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Total number of `store` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl PageStore for MemoryPageStore {
    fn load(&self, page_id: PageId) -> Result<Vec<u8>> {
        self.pages
            .lock()
            .get(&page_id)
            .cloned()
            .ok_or(LStoreError::PageNotFound { page_id })
    }

    fn store(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.pages.lock().insert(page_id, data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn exists(&self, page_id: PageId) -> Result<bool> {
        Ok(self.pages.lock().contains_key(&page_id))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPageStore")
            .field("pages", &self.len())
            .field("writes", &self.write_count())
            .finish()
    }
}
