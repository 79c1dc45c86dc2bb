//! B-tree file format constants.

/// Magic bytes at the start of every index file.
pub(crate) const HEADER_MAGIC: [u8; 4] = *b"TBIX";

/// Index file format version.
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Header page address.
pub(crate) const HEADER_PAGE: u32 = 0;

/// Page that holds the empty root leaf of a fresh index.
pub(crate) const INITIAL_ROOT_PAGE: u32 = 1;

/// Node page header: kind (1), reserved (1), entry count (2), level (2), reserved (2).
pub(crate) const NODE_HEADER_SIZE: usize = 8;

/// Size of a child branch address in a node slot.
pub(crate) const BRANCH_SIZE: usize = 4;

/// Offset of the next-free link in a page on the free list.
pub(crate) const FREE_LINK_OFFSET: usize = 4;

/// Fewest slots a node page must hold for splits and merges to work.
pub const MIN_NODE_CAPACITY: usize = 4;

/// Longest key an index accepts.
pub const MAX_KEY_LEN: usize = 4096;

/// Longest value an index accepts.
pub const MAX_VALUE_LEN: usize = 255;

/// Deepest tree the cursor stack supports.
pub(crate) const MAX_HEIGHT: usize = 32;
