//! Node codec: bounds-checked access to a B-tree page.
//!
//! Page layout:
//! ```text
//! +------------------------+ 0
//! | kind: u8               |
//! | reserved: u8           |
//! | entry_count: u16       |
//! | level: u16             |  0 = leaf
//! | reserved: u16          |
//! +------------------------+ 8 (NODE_HEADER_SIZE)
//! | slot 0                 |
//! |   branch: u32          |  child page, 0 at leaf level
//! |   key: [u8; key_len]   |
//! |   value: [u8; val_len] |
//! | slot 1 ...             |
//! +------------------------+
//! ```
//!
//! In internal nodes the key and value of slot `i` are a lower bound for
//! every entry under child `i`. The bound stored in slot 0 is never
//! consulted during descent.

use super::constants::{
    BRANCH_SIZE, MAX_HEIGHT, MAX_KEY_LEN, MAX_VALUE_LEN, MIN_NODE_CAPACITY, NODE_HEADER_SIZE,
};
use super::types::{compare_entry, SearchKey};
use std::cmp::Ordering;
use tabula_common::{PageId, PageKind, Result, TabulaError};

/// Fixed geometry shared by every node of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub page_size: usize,
    pub key_len: usize,
    pub value_len: usize,
    pub allow_duplicates: bool,
}

impl NodeLayout {
    /// Validates the geometry and builds a layout.
    pub fn new(
        page_size: usize,
        key_len: usize,
        value_len: usize,
        allow_duplicates: bool,
    ) -> Result<Self> {
        if key_len == 0 || key_len > MAX_KEY_LEN {
            return Err(TabulaError::invalid("key_len", key_len));
        }
        if value_len == 0 || value_len > MAX_VALUE_LEN {
            return Err(TabulaError::invalid("value_len", value_len));
        }
        let layout = Self {
            page_size,
            key_len,
            value_len,
            allow_duplicates,
        };
        if layout.capacity() < MIN_NODE_CAPACITY {
            return Err(TabulaError::invalid(
                "key_len",
                format!("{} (fewer than {} slots per page)", key_len, MIN_NODE_CAPACITY),
            ));
        }
        Ok(layout)
    }

    /// Bytes per slot.
    #[inline]
    pub fn slot_size(&self) -> usize {
        BRANCH_SIZE + self.key_len + self.value_len
    }

    /// Bytes of key plus value.
    #[inline]
    pub fn entry_len(&self) -> usize {
        self.key_len + self.value_len
    }

    /// Slots per node page.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.page_size.saturating_sub(NODE_HEADER_SIZE) / self.slot_size()).min(u16::MAX as usize)
    }

    /// Fewest entries a non-root node may hold.
    #[inline]
    pub fn min_entries(&self) -> usize {
        self.capacity() / 2
    }
}

/// An owned node page.
#[derive(Clone)]
pub struct Node {
    page_id: PageId,
    layout: NodeLayout,
    data: Box<[u8]>,
}

impl Node {
    /// Creates an empty node at `level` (0 = leaf).
    pub fn new(page_id: PageId, layout: NodeLayout, level: u16) -> Self {
        let mut data = vec![0u8; layout.page_size].into_boxed_slice();
        data[0] = PageKind::Node as u8;
        data[4..6].copy_from_slice(&level.to_le_bytes());
        Self {
            page_id,
            layout,
            data,
        }
    }

    /// Interprets a page image as a node, validating its header.
    pub fn from_page(page_id: PageId, layout: NodeLayout, data: Box<[u8]>) -> Result<Self> {
        let corrupted = |reason: String| TabulaError::PageCorrupted {
            page_id: page_id.0,
            reason,
        };
        if data.len() != layout.page_size {
            return Err(corrupted(format!("page image is {} bytes", data.len())));
        }
        if PageKind::from_byte(data[0]) != Some(PageKind::Node) {
            return Err(corrupted(format!("kind byte {} is not a node", data[0])));
        }
        let node = Self {
            page_id,
            layout,
            data,
        };
        if node.count() > layout.capacity() {
            return Err(corrupted(format!(
                "entry count {} exceeds capacity {}",
                node.count(),
                layout.capacity()
            )));
        }
        if node.level() as usize >= MAX_HEIGHT {
            return Err(corrupted(format!("level {} too deep", node.level())));
        }
        Ok(node)
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the raw page image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn count(&self) -> usize {
        u16::from_le_bytes([self.data[2], self.data[3]]) as usize
    }

    fn set_count(&mut self, count: usize) {
        self.data[2..4].copy_from_slice(&(count as u16).to_le_bytes());
    }

    /// Distance from the leaf level.
    #[inline]
    pub fn level(&self) -> u16 {
        u16::from_le_bytes([self.data[4], self.data[5]])
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() >= self.layout.capacity()
    }

    #[inline]
    fn slot_offset(&self, index: usize) -> usize {
        NODE_HEADER_SIZE + index * self.layout.slot_size()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.count() {
            return Err(TabulaError::IndexCorrupted(format!(
                "slot {} out of range on page {} ({} entries)",
                index,
                self.page_id,
                self.count()
            )));
        }
        Ok(())
    }

    /// Child page of slot `index`.
    pub fn branch(&self, index: usize) -> Result<PageId> {
        self.check_index(index)?;
        let off = self.slot_offset(index);
        Ok(PageId(u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])))
    }

    /// Key and value of slot `index`, contiguous.
    pub fn entry(&self, index: usize) -> Result<&[u8]> {
        self.check_index(index)?;
        let off = self.slot_offset(index) + BRANCH_SIZE;
        Ok(&self.data[off..off + self.layout.entry_len()])
    }

    pub fn key(&self, index: usize) -> Result<&[u8]> {
        Ok(&self.entry(index)?[..self.layout.key_len])
    }

    pub fn value(&self, index: usize) -> Result<&[u8]> {
        Ok(&self.entry(index)?[self.layout.key_len..])
    }

    /// Compares slot `index` against a search target.
    pub fn compare_at(&self, index: usize, target: &SearchKey<'_>) -> Result<Ordering> {
        let entry = self.entry(index)?;
        let (key, value) = entry.split_at(self.layout.key_len);
        Ok(compare_entry(key, value, target, self.layout.allow_duplicates))
    }

    /// Index of the first slot not less than `target`, or `count()` if none.
    pub fn lower_bound(&self, target: &SearchKey<'_>) -> Result<usize> {
        let (mut low, mut high) = (0usize, self.count());
        while low < high {
            let mid = low + (high - low) / 2;
            if self.compare_at(mid, target)? == Ordering::Less {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    /// Child index to descend into for `target`.
    ///
    /// Picks the last child whose lower bound does not exceed the target.
    /// Slot 0 is taken when no other bound qualifies.
    pub fn find_child(&self, target: &SearchKey<'_>) -> Result<usize> {
        let (mut low, mut high) = (1usize, self.count());
        while low < high {
            let mid = low + (high - low) / 2;
            if self.compare_at(mid, target)? == Ordering::Greater {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        Ok(low.saturating_sub(1))
    }

    /// Inserts a slot at `index`, shifting later slots right.
    pub fn insert_at(&mut self, index: usize, branch: PageId, entry: &[u8]) -> Result<()> {
        let count = self.count();
        if count >= self.layout.capacity() {
            return Err(TabulaError::NodeFull);
        }
        if index > count || entry.len() != self.layout.entry_len() {
            return Err(TabulaError::Internal(format!(
                "bad slot insert at {} of {} on page {}",
                index, count, self.page_id
            )));
        }
        let start = self.slot_offset(index);
        let end = self.slot_offset(count);
        let slot = self.layout.slot_size();
        self.data.copy_within(start..end, start + slot);
        self.write_slot(index, branch, entry);
        self.set_count(count + 1);
        Ok(())
    }

    /// Appends a slot.
    pub fn push(&mut self, branch: PageId, entry: &[u8]) -> Result<()> {
        self.insert_at(self.count(), branch, entry)
    }

    /// Removes slot `index`, shifting later slots left.
    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let count = self.count();
        let start = self.slot_offset(index + 1);
        let end = self.slot_offset(count);
        let slot = self.layout.slot_size();
        self.data.copy_within(start..end, start - slot);
        let tail = self.slot_offset(count - 1);
        self.data[tail..tail + slot].fill(0);
        self.set_count(count - 1);
        Ok(())
    }

    /// Replaces the key and value of slot `index`.
    pub fn set_entry(&mut self, index: usize, entry: &[u8]) -> Result<()> {
        self.check_index(index)?;
        if entry.len() != self.layout.entry_len() {
            return Err(TabulaError::Internal("separator length mismatch".to_string()));
        }
        let off = self.slot_offset(index) + BRANCH_SIZE;
        self.data[off..off + entry.len()].copy_from_slice(entry);
        Ok(())
    }

    fn write_slot(&mut self, index: usize, branch: PageId, entry: &[u8]) {
        let off = self.slot_offset(index);
        self.data[off..off + BRANCH_SIZE].copy_from_slice(&branch.0.to_le_bytes());
        self.data[off + BRANCH_SIZE..off + BRANCH_SIZE + entry.len()].copy_from_slice(entry);
    }

    /// Moves slots `at..` into a new node on `right_page` at the same level.
    pub fn split_off(&mut self, at: usize, right_page: PageId) -> Result<Node> {
        let count = self.count();
        if at > count {
            return Err(TabulaError::Internal(format!(
                "split point {} past {} entries",
                at, count
            )));
        }
        let mut right = Node::new(right_page, self.layout, self.level());
        let start = self.slot_offset(at);
        let end = self.slot_offset(count);
        right.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (end - start)]
            .copy_from_slice(&self.data[start..end]);
        right.set_count(count - at);
        self.data[start..end].fill(0);
        self.set_count(at);
        Ok(right)
    }

    /// Appends every slot of `other` to this node.
    pub fn append(&mut self, other: &Node) -> Result<()> {
        let count = self.count();
        let moved = other.count();
        if count + moved > self.layout.capacity() {
            return Err(TabulaError::NodeFull);
        }
        let dst = self.slot_offset(count);
        let src_end = other.slot_offset(moved);
        self.data[dst..dst + (src_end - NODE_HEADER_SIZE)]
            .copy_from_slice(&other.data[NODE_HEADER_SIZE..src_end]);
        self.set_count(count + moved);
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("page_id", &self.page_id)
            .field("level", &self.level())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::SearchKey;

    fn layout() -> NodeLayout {
        // (512 - 8) / (4 + 4 + 2) = 50 slots
        NodeLayout::new(512, 4, 2, false).unwrap()
    }

    fn entry(k: u32, v: u16) -> Vec<u8> {
        let mut e = k.to_be_bytes().to_vec();
        e.extend_from_slice(&v.to_be_bytes());
        e
    }

    fn leaf_with(keys: &[u32]) -> Node {
        let mut node = Node::new(PageId(3), layout(), 0);
        for &k in keys {
            node.push(PageId::NULL, &entry(k, 0)).unwrap();
        }
        node
    }

    #[test]
    fn test_layout_geometry() {
        let layout = layout();
        assert_eq!(layout.slot_size(), 10);
        assert_eq!(layout.capacity(), 50);
        assert_eq!(layout.min_entries(), 25);
    }

    #[test]
    fn test_layout_rejects_bad_lengths() {
        assert!(NodeLayout::new(512, 0, 4, false).is_err());
        assert!(NodeLayout::new(512, 4, 0, false).is_err());
        // 504 / (4 + 200 + 4) = 2 slots, too few
        assert!(NodeLayout::new(512, 200, 4, false).is_err());
    }

    #[test]
    fn test_node_new_and_roundtrip() {
        let mut node = Node::new(PageId(7), layout(), 2);
        node.push(PageId(11), &entry(5, 1)).unwrap();

        let image = node.as_bytes().to_vec().into_boxed_slice();
        let back = Node::from_page(PageId(7), layout(), image).unwrap();
        assert_eq!(back.level(), 2);
        assert!(!back.is_leaf());
        assert_eq!(back.count(), 1);
        assert_eq!(back.branch(0).unwrap(), PageId(11));
        assert_eq!(back.key(0).unwrap(), &5u32.to_be_bytes());
        assert_eq!(back.value(0).unwrap(), &1u16.to_be_bytes());
    }

    #[test]
    fn test_node_from_page_rejects_garbage() {
        let zeros = vec![0u8; 512].into_boxed_slice();
        assert!(Node::from_page(PageId(1), layout(), zeros).is_err());

        let mut bad_count = Node::new(PageId(1), layout(), 0).as_bytes().to_vec();
        bad_count[2..4].copy_from_slice(&999u16.to_le_bytes());
        assert!(Node::from_page(PageId(1), layout(), bad_count.into_boxed_slice()).is_err());
    }

    #[test]
    fn test_node_insert_remove_keeps_order() {
        let mut node = leaf_with(&[10, 30]);
        node.insert_at(1, PageId::NULL, &entry(20, 0)).unwrap();
        node.insert_at(0, PageId::NULL, &entry(5, 0)).unwrap();

        let keys: Vec<_> = (0..node.count())
            .map(|i| u32::from_be_bytes(node.key(i).unwrap().try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![5, 10, 20, 30]);

        node.remove_at(1).unwrap();
        assert_eq!(node.count(), 3);
        assert_eq!(node.key(1).unwrap(), &20u32.to_be_bytes());
        assert!(node.entry(3).is_err());
    }

    #[test]
    fn test_node_full() {
        let keys: Vec<u32> = (0..50).collect();
        let mut node = leaf_with(&keys);
        assert!(node.is_full());
        assert!(matches!(
            node.push(PageId::NULL, &entry(99, 0)),
            Err(TabulaError::NodeFull)
        ));
    }

    #[test]
    fn test_node_lower_bound() {
        let node = leaf_with(&[10, 20, 30]);
        let probe = |k: u32| {
            let e = entry(k, 0);
            node.lower_bound(&SearchKey::exact(&e[..4], &e[4..])).unwrap()
        };
        assert_eq!(probe(5), 0);
        assert_eq!(probe(10), 0);
        assert_eq!(probe(15), 1);
        assert_eq!(probe(30), 2);
        assert_eq!(probe(31), 3);
    }

    #[test]
    fn test_node_find_child() {
        let mut node = Node::new(PageId(2), layout(), 1);
        node.push(PageId(10), &entry(0, 0)).unwrap();
        node.push(PageId(11), &entry(100, 0)).unwrap();
        node.push(PageId(12), &entry(200, 0)).unwrap();

        let probe = |k: u32| {
            let e = entry(k, 0);
            node.find_child(&SearchKey::exact(&e[..4], &e[4..])).unwrap()
        };
        assert_eq!(probe(0), 0);
        assert_eq!(probe(99), 0);
        assert_eq!(probe(100), 1);
        assert_eq!(probe(150), 1);
        assert_eq!(probe(500), 2);
    }

    #[test]
    fn test_node_split_and_append() {
        let keys: Vec<u32> = (0..10).collect();
        let mut left = leaf_with(&keys);
        let right = left.split_off(6, PageId(9)).unwrap();

        assert_eq!(left.count(), 6);
        assert_eq!(right.count(), 4);
        assert_eq!(right.page_id(), PageId(9));
        assert_eq!(right.key(0).unwrap(), &6u32.to_be_bytes());

        left.append(&right).unwrap();
        assert_eq!(left.count(), 10);
        assert_eq!(left.key(9).unwrap(), &9u32.to_be_bytes());
    }

    #[test]
    fn test_node_set_entry() {
        let mut node = leaf_with(&[1, 2]);
        node.set_entry(1, &entry(7, 3)).unwrap();
        assert_eq!(node.key(1).unwrap(), &7u32.to_be_bytes());
        assert_eq!(node.value(1).unwrap(), &3u16.to_be_bytes());
        assert!(node.set_entry(1, &[1, 2]).is_err());
    }
}
