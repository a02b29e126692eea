//! Database handle: page store, buffer pool, version clock and catalog.

use crate::catalog::CatalogSnapshot;
use crate::disk::{DiskManager, DiskManagerConfig};
use crate::merge::MergeScheduler;
use crate::table::{Table, TableEnv};
use crate::txn::{TxMarker, VersionClock};
use lstore_buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, MemoryPageStore, PageStore};
use lstore_common::{ColumnType, LStoreError, Result, StorageConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// An embedded L-Store database.
pub struct Database {
    config: StorageConfig,
    pool: Arc<BufferPool>,
    /// None for in-memory databases.
    disk: Option<Arc<DiskManager>>,
    clock: Arc<VersionClock>,
    scheduler: Option<Arc<MergeScheduler>>,
    merge_fence: Arc<RwLock<()>>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    next_table_id: AtomicU32,
    closed: AtomicBool,
}

impl Database {
    /// Opens (or creates) a database in `path` with a pool of `pool_pages`
    /// frames and default settings otherwise.
    pub fn open(path: impl AsRef<Path>, pool_pages: usize) -> Result<Self> {
        Self::open_with_config(StorageConfig::with_dir(path.as_ref(), pool_pages))
    }

    /// Opens (or creates) a database as configured.
    pub fn open_with_config(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let disk = Arc::new(DiskManager::new(DiskManagerConfig {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        })?);
        let catalog = CatalogSnapshot::load(&config.data_dir)?;

        let store: Arc<dyn PageStore> = disk.clone();
        let db = Self::assemble(config, store, Some(disk), catalog)?;
        info!(
            data_dir = %db.config.data_dir.display(),
            tables = db.tables.read().len(),
            frames = db.pool.num_frames(),
            "opened database"
        );
        Ok(db)
    }

    /// Creates a database whose pages live only in memory.
    pub fn in_memory(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        Self::assemble(config, store, None, None)
    }

    fn assemble(
        config: StorageConfig,
        store: Arc<dyn PageStore>,
        disk: Option<Arc<DiskManager>>,
        catalog: Option<CatalogSnapshot>,
    ) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(BufferPoolConfig::from(&config), store));
        let scheduler = if config.background_merge {
            Some(MergeScheduler::start()?)
        } else {
            None
        };
        let (next_table_id, last_tick) = catalog
            .as_ref()
            .map_or((0, 0), |c| (c.next_table_id, c.clock));

        let db = Self {
            config,
            pool,
            disk,
            clock: Arc::new(VersionClock::starting_at(last_tick)),
            scheduler,
            merge_fence: Arc::new(RwLock::new(())),
            tables: RwLock::new(HashMap::new()),
            next_table_id: AtomicU32::new(next_table_id),
            closed: AtomicBool::new(false),
        };

        if let Some(catalog) = catalog {
            let mut tables = db.tables.write();
            for snapshot in catalog.tables {
                let table = Table::restore(snapshot, db.table_env())?;
                tables.insert(table.name().to_string(), table);
            }
        }
        Ok(db)
    }

    fn table_env(&self) -> TableEnv {
        TableEnv {
            pool: Arc::clone(&self.pool),
            clock: Arc::clone(&self.clock),
            merge_tail_threshold: self.config.merge_tail_threshold,
            merge_retry_limit: self.config.merge_retry_limit,
            scheduler: self.scheduler.clone(),
            merge_fence: Arc::clone(&self.merge_fence),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LStoreError::PoolClosed);
        }
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // Tables

    /// Creates a table of the given column types keyed by `key_column`.
    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnType>,
        key_column: usize,
    ) -> Result<Arc<Table>> {
        self.check_open()?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(LStoreError::TableAlreadyExists(name.to_string()));
        }

        let id = self.next_table_id.load(Ordering::Acquire);
        let table = Table::create(
            id,
            name.to_string(),
            columns,
            key_column,
            self.config.base_pages_per_range,
            self.table_env(),
        )?;
        self.next_table_id.store(id + 1, Ordering::Release);
        tables.insert(name.to_string(), Arc::clone(&table));

        info!(table = name, id, columns = table.num_columns(), "created table");
        Ok(table)
    }

    /// Looks up a table by name.
    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LStoreError::TableNotFound(name.to_string()))
    }

    /// Names of every table, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops a table along with its pages and data files.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| LStoreError::TableNotFound(name.to_string()))?;

        // Handles still held elsewhere fail with TableNotFound from here on.
        let _fence = self.merge_fence.write();
        let _stripes = table.retire();

        let table_id = table.id();
        let discarded = self.pool.discard_where(|page_id| page_id.table_id == table_id)?;
        if let Some(disk) = &self.disk {
            disk.delete_table(table_id)?;
        }

        info!(table = name, discarded, "dropped table");
        Ok(())
    }

    // Transactions

    /// Opens a transaction marker.
    ///
    /// Waits for running merges to finish. Merges started afterwards defer
    /// until the marker is closed.
    pub fn begin(&self) -> TxMarker {
        let _fence = self.merge_fence.write();
        self.clock.begin()
    }

    /// Closes a marker, keeping every mutation made since it.
    pub fn commit(&self, marker: TxMarker) -> Result<()> {
        self.end_marker(marker)
    }

    /// Reverts every mutation made since `marker`, then closes it.
    ///
    /// Returns the number of mutations reverted.
    pub fn discard_since(&self, marker: TxMarker) -> Result<usize> {
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        let mut reverted = 0;
        for table in &tables {
            reverted += table.rollback_since(marker)?;
        }
        self.end_marker(marker)?;
        Ok(reverted)
    }

    fn end_marker(&self, marker: TxMarker) -> Result<()> {
        if !self.clock.end(marker) {
            return Err(LStoreError::InvalidParameter {
                name: "marker".to_string(),
                value: marker.tick().to_string(),
            });
        }
        let oldest = self.clock.oldest_active();
        for table in self.tables.read().values() {
            table.prune_undo(oldest);
        }
        Ok(())
    }

    // Durability

    /// Flushes every dirty page and rewrites the catalog.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_open()?;
        // No merge may move index entries between the snapshot and the flush.
        let _fence = self.merge_fence.write();

        let tables: Vec<_> = {
            let tables = self.tables.read();
            let mut snapshots: Vec<_> = tables.values().map(|t| t.snapshot()).collect();
            snapshots.sort_by_key(|s| s.id);
            snapshots
        };
        let catalog = CatalogSnapshot::new(
            self.next_table_id.load(Ordering::Acquire),
            self.clock.now(),
            tables,
        );

        let flushed = self.pool.flush_all()?;
        if let Some(disk) = &self.disk {
            disk.flush()?;
            catalog.save(&self.config.data_dir, self.config.fsync_enabled)?;
        }

        info!(tables = catalog.tables.len(), flushed, "checkpoint complete");
        Ok(())
    }

    /// Stops background merging, checkpoints and shuts the pool down.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown();
        }
        self.checkpoint()?;
        self.closed.store(true, Ordering::Release);
        self.pool.shutdown()?;

        info!(data_dir = %self.config.data_dir.display(), "closed database");
        Ok(())
    }

    /// Buffer pool counters.
    pub fn buffer_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.config.data_dir)
            .field("tables", &self.table_names())
            .field("in_memory", &self.disk.is_none())
            .finish()
    }
}
