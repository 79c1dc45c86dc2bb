//! Page identifiers and size constants for Tabula index files.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Smallest page size an index file may use.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size an index file may use.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Address of a page within an index file.
///
/// Page 0 is the file header, so the value 0 doubles as the null branch
/// address stored in leaf-level node slots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PageId(pub u32);

impl PageId {
    /// The header page, also used as the "no child" branch marker.
    pub const NULL: PageId = PageId(0);

    /// Creates a new PageId.
    pub const fn new(page_num: u32) -> Self {
        Self(page_num)
    }

    /// Returns the page number.
    #[inline]
    pub const fn page_num(&self) -> u32 {
        self.0
    }

    /// Returns true if this is the null branch address.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Byte offset of this page in a file with the given page size.
    #[inline]
    pub fn file_offset(&self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind byte stored at offset 0 of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageKind {
    /// Never written or zeroed page.
    Unused = 0,
    /// File header (page 0).
    Header = 1,
    /// B-tree node, leaf or internal.
    Node = 2,
    /// Page on the free list.
    Free = 3,
}

impl PageKind {
    /// Decodes a kind byte, returning None for unknown values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PageKind::Unused),
            1 => Some(PageKind::Header),
            2 => Some(PageKind::Node),
            3 => Some(PageKind::Free),
            _ => None,
        }
    }
}

/// Returns true if `size` is an acceptable page size.
pub fn is_valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}
