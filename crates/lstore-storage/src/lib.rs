//! Storage engine for LStore.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - Column pages of fixed-width slots
//! - Page ranges with base and append-only tail pages
//! - Primary and secondary indexes mapping values to record versions
//! - Tables with versioned insert/update/select/delete
//! - Merge engine folding tail versions into fresh base pages
//! - Transaction markers with undo, and a persisted catalog

mod catalog;
mod column_page;
mod db;
mod disk;
mod index;
mod merge;
mod range;
mod record;
mod table;
mod txn;

pub use catalog::{CatalogSnapshot, TableSnapshot, CATALOG_FILE};
pub use column_page::ColumnPage;
pub use db::Database;
pub use disk::{DiskManager, DiskManagerConfig};
pub use index::{ColumnIndex, TableIndex};
pub use merge::{MergeOutcome, MergeScheduler};
pub use range::{MergeTicket, PageRange, RangeState, TableLayout, VersionMeta};
pub use record::{
    column_mask, Record, Rid, VersionSpec, INDIRECTION_COLUMN, MAX_DATA_COLUMNS, MAX_RANGE_ID,
    METADATA_COLUMNS, RID_COLUMN, SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN, TOMBSTONE_BIT,
};
pub use table::{Table, LOCK_STRIPES};
pub use txn::{TxMarker, UndoAction, UndoEntry, UndoLog, VersionClock};

pub use lstore_common::{ColumnType, LStoreError, Result, StorageConfig, Value};
