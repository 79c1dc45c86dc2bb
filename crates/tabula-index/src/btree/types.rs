//! Common types for the B-tree: search targets, cursor stack entries,
//! structural change descriptors and verification statistics.

use bytes::Bytes;
use std::cmp::Ordering;
use tabula_common::PageId;

/// Which end of a run of partially matching entries a search lands on.
///
/// A search key shorter than the index key, or a duplicate-index search
/// without a value, matches a whole run of entries. `Min` places the target
/// before that run and `Max` after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTail {
    Min,
    Max,
}

/// Target of a descent through the tree.
#[derive(Debug, Clone, Copy)]
pub struct SearchKey<'a> {
    /// Key bytes, possibly a prefix of the full key.
    pub key: &'a [u8],
    /// Value bytes. Only consulted by indexes that allow duplicates.
    pub value: Option<&'a [u8]>,
    pub tail: SearchTail,
}

impl<'a> SearchKey<'a> {
    /// Targets one exact entry.
    pub fn exact(key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            key,
            value: Some(value),
            tail: SearchTail::Min,
        }
    }

    /// Targets the start of the run of entries whose key begins with `key`.
    pub fn run_start(key: &'a [u8]) -> Self {
        Self {
            key,
            value: None,
            tail: SearchTail::Min,
        }
    }

    /// Targets the position just past the run of entries whose key begins with `key`.
    pub fn run_end(key: &'a [u8]) -> Self {
        Self {
            key,
            value: None,
            tail: SearchTail::Max,
        }
    }
}

/// Compares a stored entry against a search target.
///
/// Keys compare byte-wise. Indexes with duplicates break key ties on the
/// value, so every entry has a distinct position.
#[inline]
pub fn compare_entry(
    entry_key: &[u8],
    entry_value: &[u8],
    target: &SearchKey<'_>,
    allow_duplicates: bool,
) -> Ordering {
    let n = target.key.len().min(entry_key.len());
    match compare_keys(&entry_key[..n], &target.key[..n]) {
        Ordering::Equal => {}
        other => return other,
    }
    let past_target = match target.tail {
        SearchTail::Min => Ordering::Greater,
        SearchTail::Max => Ordering::Less,
    };
    if target.key.len() < entry_key.len() {
        return past_target;
    }
    match target.value {
        None => past_target,
        Some(_) if !allow_duplicates => Ordering::Equal,
        Some(value) => entry_value.cmp(value),
    }
}

/// Key comparison using a u64 prefix for keys of 8 bytes or more.
#[inline(always)]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() >= 8 && b.len() >= 8 {
        let a_prefix = u64::from_be_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
        let b_prefix = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        if a_prefix != b_prefix {
            return a_prefix.cmp(&b_prefix);
        }
    }
    a.cmp(b)
}

/// One level of a cursor's root-to-leaf path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    pub page: PageId,
    /// Slot within the page: child index for internal pages, entry index for the leaf.
    pub offset: u16,
}

impl StackEntry {
    pub fn new(page: PageId, offset: usize) -> Self {
        Self {
            page,
            offset: offset as u16,
        }
    }
}

/// Kind of structural change described by a `ModInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModKind {
    /// Entry added to a node with room to spare.
    Insert,
    /// Entry added and one or more nodes split.
    Split,
    /// Entry removed without rebalancing.
    Remove,
    /// Entry removed and a node borrowed from a sibling.
    Borrow,
    /// Entry removed and nodes merged.
    Merge,
    /// The root page was replaced (split root or collapsed root).
    RootChange,
    /// The whole tree was rebuilt or reset.
    BulkLoad,
}

/// Description of a completed tree mutation, delivered to every open cursor.
#[derive(Debug, Clone)]
pub struct ModInfo {
    pub kind: ModKind,
    /// Pages written or freed by the mutation.
    pub pages: Vec<PageId>,
    pub root_changed: bool,
    /// Key of the inserted or removed entry.
    pub key: Bytes,
    /// Value of the inserted or removed entry.
    pub value: Bytes,
    /// Cursor that requested the mutation, if any.
    pub origin: Option<crate::btree::registry::CursorHandle>,
}

impl ModInfo {
    /// Change that replaced the whole tree.
    pub(crate) fn bulk_load() -> Self {
        Self {
            kind: ModKind::BulkLoad,
            pages: Vec::new(),
            root_changed: true,
            key: Bytes::new(),
            value: Bytes::new(),
            origin: None,
        }
    }

    /// Returns true if a cursor whose path covers `pages` must relocate.
    pub fn affects(&self, pages: &[StackEntry]) -> bool {
        if self.root_changed || self.kind == ModKind::BulkLoad {
            return true;
        }
        pages.iter().any(|entry| self.pages.contains(&entry.page))
    }
}

/// Shape of a tree as measured by `Index::verify`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: u16,
    pub entries: u64,
    pub leaf_pages: u64,
    pub internal_pages: u64,
    pub free_pages: u64,
    /// Fewest entries found in any non-root node.
    pub min_fill: usize,
    /// Most entries found in any node.
    pub max_fill: usize,
}
