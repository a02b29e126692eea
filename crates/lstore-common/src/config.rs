//! Configuration structures for LStore.

use crate::error::{LStoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for data files and the catalog.
    pub data_dir: PathBuf,
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
    /// Number of base pages per column in one page range.
    pub base_pages_per_range: u32,
    /// Tail pages accumulated since the last merge before a range is merged.
    pub merge_tail_threshold: u32,
    /// Number of times a conflicting merge is re-run before giving up.
    pub merge_retry_limit: u32,
    /// Run triggered merges on a background worker thread.
    pub background_merge: bool,
    /// Tie-break rule between eviction candidates with equal visit counts.
    pub tie_break: TieBreak,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_pages: 1024, // 4 MB with 4 KB pages
            fsync_enabled: true,
            base_pages_per_range: 16,
            merge_tail_threshold: 8,
            merge_retry_limit: 3,
            background_merge: true,
            tie_break: TieBreak::RecencyThenPageId,
        }
    }
}

impl StorageConfig {
    /// Returns a config rooted at `data_dir` with the given pool size.
    pub fn with_dir(data_dir: impl Into<PathBuf>, buffer_pool_pages: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            buffer_pool_pages,
            ..Default::default()
        }
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StorageConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool_pages == 0 {
            return Err(LStoreError::ConfigError(
                "buffer_pool_pages must be at least 1".to_string(),
            ));
        }
        if self.base_pages_per_range == 0 {
            return Err(LStoreError::ConfigError(
                "base_pages_per_range must be at least 1".to_string(),
            ));
        }
        if self.merge_tail_threshold == 0 {
            return Err(LStoreError::ConfigError(
                "merge_tail_threshold must be at least 1".to_string(),
            ));
        }
        if self.merge_retry_limit == 0 {
            return Err(LStoreError::ConfigError(
                "merge_retry_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordering among eviction candidates that share the lowest visit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TieBreak {
    /// Least recently accessed first, then lowest page id.
    #[default]
    RecencyThenPageId,
    /// Lowest page id only.
    PageId,
}
