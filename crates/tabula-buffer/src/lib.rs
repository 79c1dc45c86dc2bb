//! Page cache for Tabula index files.
//!
//! This crate provides in-memory page caching with:
//! - Fixed frame count, frame size chosen per index file
//! - Clock eviction policy for cache management
//! - Pin counting so hot pages stay resident
//! - Hit, miss and eviction counters

mod frame;
mod page_table;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PageReadGuard};
pub use replacer::{ClockReplacer, Replacer};
