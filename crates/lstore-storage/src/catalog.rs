//! Persisted catalog: table schemas, range cursors and index entries.

use crate::range::RangeState;
use crate::record::Rid;
use lstore_common::{ColumnType, LStoreError, Result, Value};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the catalog inside the data directory.
pub const CATALOG_FILE: &str = "catalog.json";

const CATALOG_VERSION: u32 = 1;

/// Everything needed to reopen a database besides the pages themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub version: u32,
    /// Identifier the next created table receives.
    pub next_table_id: u32,
    /// Last version-clock tick handed out.
    pub clock: u64,
    pub tables: Vec<TableSnapshot>,
}

/// Persistent state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub id: u32,
    pub name: String,
    pub columns: Vec<ColumnType>,
    pub key_column: usize,
    pub base_pages_per_range: u32,
    /// Cursors per range, indexed by range id.
    pub ranges: Vec<RangeState>,
    /// Primary index entries in key order.
    pub primary: Vec<(Value, Rid)>,
    /// Columns whose secondary index is rebuilt on open.
    pub indexed_columns: Vec<usize>,
}

impl CatalogSnapshot {
    /// Creates an empty catalog.
    pub fn new(next_table_id: u32, clock: u64, tables: Vec<TableSnapshot>) -> Self {
        Self {
            version: CATALOG_VERSION,
            next_table_id,
            clock,
            tables,
        }
    }

    /// Path of the catalog in `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CATALOG_FILE)
    }

    /// Reads the catalog in `dir`. Returns None if none was written yet.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: CatalogSnapshot = serde_json::from_reader(BufReader::new(file))?;
        if snapshot.version != CATALOG_VERSION {
            return Err(LStoreError::ConfigError(format!(
                "unsupported catalog version {} in {}",
                snapshot.version,
                path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    /// Writes the catalog to `dir`, replacing any previous one atomically.
    pub fn save(&self, dir: &Path, fsync: bool) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");

        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
            if fsync {
                writer.get_ref().sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), tables = self.tables.len(), "wrote catalog");
        Ok(())
    }
}
