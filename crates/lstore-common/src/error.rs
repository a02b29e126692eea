//! Error types for LStore.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using LStoreError.
pub type Result<T> = std::result::Result<T, LStoreError>;

/// Errors that can occur in LStore operations.
#[derive(Debug, Error)]
pub enum LStoreError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Record errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    // Buffer pool errors
    #[error("Buffer pool capacity exceeded: all {frames} frames are pinned")]
    CapacityExceeded { frames: usize },

    #[error("Invalid page handle: {page_id}")]
    InvalidHandle { page_id: PageId },

    #[error("Buffer pool is closed")]
    PoolClosed,

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    // Merge errors
    #[error("Merge conflict on page range {range_id} after {attempts} attempts")]
    MergeConflict { range_id: u32, attempts: u32 },

    // Type errors
    #[error("Type mismatch in column {column}: expected {expected}, got {actual}")]
    TypeMismatch {
        column: usize,
        expected: String,
        actual: String,
    },

    #[error("Value too large for column {column}: {size} bytes (max {max})")]
    ValueTooLarge {
        column: usize,
        size: usize,
        max: usize,
    },

    #[error("Column out of range: {column} (table has {num_columns})")]
    ColumnOutOfRange { column: usize, num_columns: usize },

    #[error("Schema mismatch: expected {expected} values, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    // Catalog errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Index not found on column {0}")]
    IndexNotFound(usize),

    #[error("Catalog error: {0}")]
    Catalog(#[from] serde_json::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LStoreError {
    /// Returns true for errors raised by the buffer pool while pinning or
    /// releasing pages.
    pub fn is_buffer_error(&self) -> bool {
        matches!(
            self,
            LStoreError::CapacityExceeded { .. }
                | LStoreError::InvalidHandle { .. }
                | LStoreError::PoolClosed
        )
    }
}
