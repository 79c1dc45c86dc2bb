//! Point insert and remove with splits, borrows and merges, plus the
//! structural checker.
//!
//! Writes follow one order: children before parents, parents before the
//! header, and freed pages only once the header no longer reaches them.

use super::node::{Node, NodeLayout};
use super::store::{BlockStore, TreeRoot};
use super::types::{compare_entry, ModInfo, ModKind, SearchKey, TreeStats};
use bytes::Bytes;
use std::cmp::Ordering;
use tabula_common::{PageId, Result, TabulaError};
use tracing::debug;

/// Root-to-leaf path of nodes with the slot taken at each level.
struct Path {
    nodes: Vec<Node>,
    slots: Vec<usize>,
}

fn descend(store: &BlockStore, tree: &TreeRoot, target: &SearchKey<'_>) -> Result<Path> {
    let mut nodes = Vec::with_capacity(tree.height as usize);
    let mut slots = Vec::with_capacity(tree.height as usize);
    let mut node = store.read_node(tree.root)?;
    while !node.is_leaf() {
        let index = node.find_child(target)?;
        let child = store.read_node(node.branch(index)?)?;
        if child.level() + 1 != node.level() {
            return Err(TabulaError::IndexCorrupted(format!(
                "level mismatch below page {}",
                node.page_id()
            )));
        }
        nodes.push(node);
        slots.push(index);
        node = child;
    }
    let pos = node.lower_bound(target)?;
    nodes.push(node);
    slots.push(pos);
    Ok(Path { nodes, slots })
}

fn make_entry(layout: &NodeLayout, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    if key.len() != layout.key_len {
        return Err(TabulaError::invalid("key length", key.len()));
    }
    if value.len() != layout.value_len {
        return Err(TabulaError::invalid("value length", value.len()));
    }
    let mut entry = Vec::with_capacity(layout.entry_len());
    entry.extend_from_slice(key);
    entry.extend_from_slice(value);
    Ok(entry)
}

/// Inserts one entry, splitting full nodes on the way up.
pub(crate) fn insert_entry(
    store: &BlockStore,
    tree: &mut TreeRoot,
    key: &[u8],
    value: &[u8],
) -> Result<ModInfo> {
    let layout = *store.layout();
    let entry = make_entry(&layout, key, value)?;
    let target = SearchKey::exact(key, value);
    let Path { mut nodes, slots } = descend(store, tree, &target)?;

    let depth = nodes.len();
    let leaf = &nodes[depth - 1];
    let pos = slots[depth - 1];
    if pos < leaf.count() && leaf.compare_at(pos, &target)? == Ordering::Equal {
        return Err(TabulaError::DuplicateKey);
    }

    // every node in the trailing full run splits; a full root also needs a new root
    let splits = nodes.iter().rev().take_while(|n| n.is_full()).count();
    let grows_root = splits == depth;
    let mut fresh = store
        .allocate_pages(splits + grows_root as usize)?
        .into_iter();
    let mut next_page = || {
        fresh
            .next()
            .ok_or_else(|| TabulaError::Internal("split page reservation short".to_string()))
    };

    let mut writes: Vec<Node> = Vec::with_capacity(splits * 2 + 1);
    let mut carry_branch = PageId::NULL;
    let mut carry_entry = entry;
    let mut at = pos;
    let mut level = depth;
    let mut root_split: Option<(Vec<u8>, Vec<u8>, PageId)> = None;

    while level > 0 {
        level -= 1;
        let node = &mut nodes[level];
        if !node.is_full() {
            node.insert_at(at, carry_branch, &carry_entry)?;
            writes.push(node.clone());
            break;
        }

        let count = node.count();
        let mid = (count + 1) / 2;
        let right_page = next_page()?;
        let right = if at < mid {
            let right = node.split_off(mid - 1, right_page)?;
            node.insert_at(at, carry_branch, &carry_entry)?;
            right
        } else {
            let mut right = node.split_off(mid, right_page)?;
            right.insert_at(at - mid, carry_branch, &carry_entry)?;
            right
        };
        let separator = right.entry(0)?.to_vec();
        debug!(left = %node.page_id(), right = %right_page, level = node.level(), "node split");
        writes.push(right);
        writes.push(node.clone());

        if level == 0 {
            root_split = Some((node.entry(0)?.to_vec(), separator, right_page));
            break;
        }
        carry_branch = right_page;
        carry_entry = separator;
        at = slots[level - 1] + 1;
    }

    let mut root_changed = false;
    if let Some((left_bound, separator, right_page)) = root_split {
        let old_root = nodes[0].page_id();
        let mut root = Node::new(next_page()?, layout, nodes[0].level() + 1);
        root.push(old_root, &left_bound)?;
        root.push(right_page, &separator)?;
        tree.root = root.page_id();
        tree.height += 1;
        root_changed = true;
        writes.push(root);
    }

    for node in &writes {
        store.write_node(node)?;
    }
    tree.entries += 1;
    store.write_header(tree)?;

    let kind = if root_changed {
        ModKind::RootChange
    } else if splits > 0 {
        ModKind::Split
    } else {
        ModKind::Insert
    };
    Ok(ModInfo {
        kind,
        pages: writes.iter().map(Node::page_id).collect(),
        root_changed,
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
        origin: None,
    })
}

/// Removes one exact entry and rebalances. Returns None if it is absent.
pub(crate) fn remove_entry(
    store: &BlockStore,
    tree: &mut TreeRoot,
    key: &[u8],
    value: &[u8],
) -> Result<Option<ModInfo>> {
    let layout = *store.layout();
    make_entry(&layout, key, value)?;
    let target = SearchKey::exact(key, value);
    let Path { mut nodes, slots } = descend(store, tree, &target)?;

    let depth = nodes.len();
    let pos = slots[depth - 1];
    {
        let leaf = &nodes[depth - 1];
        if pos >= leaf.count()
            || leaf.compare_at(pos, &target)? != Ordering::Equal
            || leaf.value(pos)? != value
        {
            return Ok(None);
        }
    }
    nodes[depth - 1].remove_at(pos)?;

    let min = layout.min_entries();
    let mut kind = ModKind::Remove;
    let mut writes: Vec<Node> = Vec::new();
    let mut freed: Vec<PageId> = Vec::new();
    let mut dirty = vec![false; depth];
    dirty[depth - 1] = true;

    let mut level = depth - 1;
    while level > 0 && nodes[level].count() < min {
        let (upper, lower) = nodes.split_at_mut(level);
        let parent = &mut upper[level - 1];
        let node = &mut lower[0];
        let idx = slots[level - 1];
        dirty[level - 1] = true;

        if idx > 0 {
            let mut left = store.read_node(parent.branch(idx - 1)?)?;
            if left.count() > min {
                let last = left.count() - 1;
                let moved_branch = left.branch(last)?;
                let moved = left.entry(last)?.to_vec();
                left.remove_at(last)?;
                if !node.is_leaf() {
                    node.set_entry(0, parent.entry(idx)?)?;
                }
                node.insert_at(0, moved_branch, &moved)?;
                parent.set_entry(idx, &moved)?;
                writes.push(left);
                writes.push(node.clone());
                dirty[level] = false;
                if kind == ModKind::Remove {
                    kind = ModKind::Borrow;
                }
                break;
            }
            if !node.is_leaf() {
                node.set_entry(0, parent.entry(idx)?)?;
            }
            left.append(node)?;
            parent.remove_at(idx)?;
            freed.push(node.page_id());
            writes.push(left);
        } else {
            if parent.count() < 2 {
                return Err(TabulaError::IndexCorrupted(format!(
                    "page {} has a single child",
                    parent.page_id()
                )));
            }
            let mut right = store.read_node(parent.branch(1)?)?;
            if right.count() > min {
                let moved_branch = right.branch(0)?;
                let moved = if node.is_leaf() {
                    right.entry(0)?.to_vec()
                } else {
                    parent.entry(1)?.to_vec()
                };
                node.push(moved_branch, &moved)?;
                right.remove_at(0)?;
                parent.set_entry(1, right.entry(0)?)?;
                writes.push(right);
                writes.push(node.clone());
                dirty[level] = false;
                if kind == ModKind::Remove {
                    kind = ModKind::Borrow;
                }
                break;
            }
            if !right.is_leaf() {
                right.set_entry(0, parent.entry(1)?)?;
            }
            node.append(&right)?;
            parent.remove_at(1)?;
            freed.push(right.page_id());
            writes.push(node.clone());
        }
        debug!(page = %parent.page_id(), level = parent.level(), "nodes merged");
        dirty[level] = false;
        kind = ModKind::Merge;
        level -= 1;
    }

    for d in (0..depth).rev() {
        if dirty[d] {
            writes.push(nodes[d].clone());
        }
    }

    let mut root_changed = false;
    let mut root = nodes.swap_remove(0);
    while !root.is_leaf() && root.count() == 1 {
        let child = root.branch(0)?;
        freed.push(root.page_id());
        writes.retain(|n| n.page_id() != root.page_id());
        // the child may have been rewritten above and not yet flushed
        root = match writes.iter().find(|n| n.page_id() == child) {
            Some(node) => node.clone(),
            None => store.read_node(child)?,
        };
        tree.root = child;
        tree.height -= 1;
        root_changed = true;
        kind = ModKind::RootChange;
    }

    for node in &writes {
        store.write_node(node)?;
    }
    tree.entries = tree.entries.saturating_sub(1);
    store.write_header(tree)?;
    if !freed.is_empty() {
        for &page in &freed {
            store.free_page(page)?;
        }
        store.write_header(tree)?;
    }

    let mut pages: Vec<PageId> = writes.iter().map(Node::page_id).collect();
    pages.extend_from_slice(&freed);
    Ok(Some(ModInfo {
        kind,
        pages,
        root_changed,
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
        origin: None,
    }))
}

/// Orders two full entries the way the index stores them.
fn compare_entries(layout: &NodeLayout, a: &[u8], b: &[u8]) -> Ordering {
    let (a_key, a_value) = a.split_at(layout.key_len);
    let (b_key, b_value) = b.split_at(layout.key_len);
    compare_entry(
        a_key,
        a_value,
        &SearchKey::exact(b_key, b_value),
        layout.allow_duplicates,
    )
}

struct Checker<'a> {
    store: &'a BlockStore,
    layout: NodeLayout,
    stats: TreeStats,
    last: Option<Vec<u8>>,
}

impl Checker<'_> {
    fn corrupted(&self, page: PageId, what: &str) -> TabulaError {
        TabulaError::IndexCorrupted(format!("page {}: {}", page, what))
    }

    /// Walks the subtree under `page`; `bound` is its separator, if checked.
    fn walk(&mut self, page: PageId, level: u16, is_root: bool, bound: Option<&[u8]>) -> Result<()> {
        let node = self.store.read_node(page)?;
        if node.level() != level {
            return Err(self.corrupted(page, "unexpected level"));
        }
        let count = node.count();
        if !is_root {
            if count < self.layout.min_entries() {
                return Err(self.corrupted(page, "underfull node"));
            }
            self.stats.min_fill = self.stats.min_fill.min(count);
        }
        self.stats.max_fill = self.stats.max_fill.max(count);
        if let (Some(bound), true) = (bound, count > 0) {
            if compare_entries(&self.layout, bound, node.entry(0)?) == Ordering::Greater {
                return Err(self.corrupted(page, "separator above first entry"));
            }
        }

        if node.is_leaf() {
            self.stats.leaf_pages += 1;
            for i in 0..count {
                let entry = node.entry(i)?;
                if let Some(last) = &self.last {
                    if compare_entries(&self.layout, last, entry) != Ordering::Less {
                        return Err(self.corrupted(page, "entries out of order"));
                    }
                }
                self.last = Some(entry.to_vec());
                self.stats.entries += 1;
            }
            return Ok(());
        }

        self.stats.internal_pages += 1;
        if count < 2 && is_root {
            return Err(self.corrupted(page, "internal root with one child"));
        }
        for i in 0..count {
            let separator = node.entry(i)?.to_vec();
            if i > 0 {
                if let Some(last) = &self.last {
                    if compare_entries(&self.layout, last, &separator) != Ordering::Less {
                        return Err(self.corrupted(page, "separator not above left subtree"));
                    }
                }
            }
            let check = (i > 0).then_some(separator.as_slice());
            self.walk(node.branch(i)?, level - 1, false, check)?;
        }
        Ok(())
    }
}

/// Checks ordering, fill and balance of the whole tree.
pub(crate) fn verify(store: &BlockStore, tree: &TreeRoot) -> Result<TreeStats> {
    let root = store.read_node(tree.root)?;
    if root.level() + 1 != tree.height {
        return Err(TabulaError::IndexCorrupted(format!(
            "root level {} does not match height {}",
            root.level(),
            tree.height
        )));
    }
    let mut checker = Checker {
        store,
        layout: *store.layout(),
        stats: TreeStats {
            height: tree.height,
            min_fill: usize::MAX,
            ..Default::default()
        },
        last: None,
    };
    checker.walk(tree.root, root.level(), true, None)?;

    let mut stats = checker.stats;
    if stats.min_fill == usize::MAX {
        stats.min_fill = root.count();
    }
    if stats.entries != tree.entries {
        return Err(TabulaError::IndexCorrupted(format!(
            "header counts {} entries, tree holds {}",
            tree.entries, stats.entries
        )));
    }
    stats.free_pages = store.free_count()?;
    Ok(stats)
}
