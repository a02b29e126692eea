//! LStore common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all LStore components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{StorageConfig, TieBreak};
pub use error::{LStoreError, Result};
pub use page::{PageHeader, PageId, PageKind, PAGE_SIZE};
pub use types::{ColumnType, Value};
