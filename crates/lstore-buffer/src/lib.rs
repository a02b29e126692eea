//! Buffer pool management for LStore.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable page count
//! - LFU eviction with a configurable tie-break
//! - Pin counting for concurrent access
//! - Dirty page tracking with write-back through a `PageStore`

mod frame;
mod pool;
mod replacer;
mod store;

pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PageReadGuard, PageWriteGuard};
pub use replacer::{LfuReplacer, Replacer};
pub use store::{MemoryPageStore, PageStore};
