//! External ordered indexes for Tabula.
//!
//! This crate provides:
//! - Page file and block store for index files
//! - Disk-resident B-tree with live, mutation-tolerant cursors
//! - Key Pool external sort and bottom-up bulk loading
//! - Row iterator contract with an in-memory implementation
//! - Key expressions producing byte-comparable keys from rows
//! - Composite row iterators presenting base rows in index order

mod btree;
mod composite;
mod disk;
mod expr;
mod facade;
mod keypool;
mod memory;
mod progress;
mod rows;

pub use btree::{
    CacheHold, CursorHandle, CursorState, FileHeader, Index, IndexCursor, ModInfo, ModKind,
    NodeLayout, SearchKey, SearchTail, StackEntry, TreeRoot, TreeStats, MAX_KEY_LEN,
    MAX_VALUE_LEN, MIN_NODE_CAPACITY,
};
pub use composite::CompositeRowIterator;
pub use disk::PageFile;
pub use expr::{ColumnKey, CompositeKey, FnKey, KeyExpression};
pub use facade::{build_external_index, partial_path, seek_row, wrap_with_index, BuildOptions};
pub use keypool::{KeyPool, SortedRecords};
pub use memory::{MemoryRowIterator, MemoryTable};
pub use progress::{CancelAfter, LogProgress, NoProgress, ProgressSink};
pub use rows::{
    ColumnDesc, ColumnHandle, IteratorFlags, RowEvent, RowIterator, SortOrder, Structure,
};
pub use tabula_common::{BulkConfig, ColumnType, IndexConfig, Result, RowId, TabulaError, Value};
