//! Disk-resident B-tree index.
//!
//! The index lives in one file of fixed-size pages:
//!
//! ```text
//! page 0   header: magic, version, layout, root, height, entries, free list
//! page 1.. nodes:  [kind u8 | pad | count u16 | level u16 | pad u16]
//!                  [branch u32 | key | value] * count
//! ```
//!
//! Leaves sit at level 0. Slot `i` of an internal node holds child `i` and
//! the smallest entry of that child's subtree. Entries are ordered by key,
//! and by (key, value) when duplicates are allowed.
//!
//! ## Write order
//!
//! Pages go through the cache straight to the file. A mutation writes
//! children before parents and the header last; pages it releases join the
//! free list only after the header stops referring to them.
//!
//! ## Cursors
//!
//! Cursors hold a root-to-leaf stack plus a copy of their entry. Each
//! mutation produces a `ModInfo` and relocates every registered cursor whose
//! path it touched before the tree lock is released.

mod bulk;
mod constants;
mod cursor;
mod index;
mod node;
mod registry;
mod store;
mod tree;
mod types;
mod view;

pub use constants::{MAX_KEY_LEN, MAX_VALUE_LEN, MIN_NODE_CAPACITY};
pub use cursor::{CursorState, IndexCursor};
pub use index::{CacheHold, Index};
pub use node::NodeLayout;
pub use registry::CursorHandle;
pub use store::{FileHeader, TreeRoot};
pub use types::{ModInfo, ModKind, SearchKey, SearchTail, StackEntry, TreeStats};
