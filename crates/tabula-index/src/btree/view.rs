//! Read-only navigation over a tree snapshot.
//!
//! Every function takes the store and a `TreeRoot` read under the tree lock
//! and produces or updates a root-to-leaf stack of `StackEntry`.

use super::constants::MAX_HEIGHT;
use super::node::Node;
use super::store::{BlockStore, TreeRoot};
use super::types::{SearchKey, StackEntry};
use bytes::Bytes;
use tabula_common::{PageId, Result, TabulaError};

fn check_depth(stack: &[StackEntry]) -> Result<()> {
    if stack.len() >= MAX_HEIGHT {
        return Err(TabulaError::IndexCorrupted(format!(
            "descent deeper than {} levels",
            MAX_HEIGHT
        )));
    }
    Ok(())
}

/// Reads the child under `node` and checks it sits one level lower.
fn child_of(store: &BlockStore, node: &Node, index: usize) -> Result<Node> {
    let child = store.read_node(node.branch(index)?)?;
    if child.level() + 1 != node.level() {
        return Err(TabulaError::IndexCorrupted(format!(
            "page {} at level {} under page {} at level {}",
            child.page_id(),
            child.level(),
            node.page_id(),
            node.level()
        )));
    }
    Ok(child)
}

/// Extends `stack` from `node` down to a leaf, always taking the first
/// (or last, when `rightmost`) slot.
fn descend_edge(
    store: &BlockStore,
    mut node: Node,
    stack: &mut Vec<StackEntry>,
    rightmost: bool,
) -> Result<()> {
    loop {
        check_depth(stack)?;
        let count = node.count();
        if count == 0 {
            return Err(TabulaError::IndexCorrupted(format!(
                "empty node {} below the root",
                node.page_id()
            )));
        }
        let index = if rightmost { count - 1 } else { 0 };
        stack.push(StackEntry::new(node.page_id(), index));
        if node.is_leaf() {
            return Ok(());
        }
        node = child_of(store, &node, index)?;
    }
}

/// Path to the first entry, or None for an empty tree.
pub(crate) fn descend_first(store: &BlockStore, tree: &TreeRoot) -> Result<Option<Vec<StackEntry>>> {
    descend_from_root(store, tree, false)
}

/// Path to the last entry, or None for an empty tree.
pub(crate) fn descend_last(store: &BlockStore, tree: &TreeRoot) -> Result<Option<Vec<StackEntry>>> {
    descend_from_root(store, tree, true)
}

fn descend_from_root(
    store: &BlockStore,
    tree: &TreeRoot,
    rightmost: bool,
) -> Result<Option<Vec<StackEntry>>> {
    let root = store.read_node(tree.root)?;
    if root.count() == 0 {
        return Ok(None);
    }
    let mut stack = Vec::with_capacity(tree.height as usize);
    descend_edge(store, root, &mut stack, rightmost)?;
    Ok(Some(stack))
}

/// Path to the first entry not less than `target`, or None if every entry
/// is less.
pub(crate) fn lower_bound(
    store: &BlockStore,
    tree: &TreeRoot,
    target: &SearchKey<'_>,
) -> Result<Option<Vec<StackEntry>>> {
    let mut stack = Vec::with_capacity(tree.height as usize);
    let mut node = store.read_node(tree.root)?;
    while !node.is_leaf() {
        check_depth(&stack)?;
        let index = node.find_child(target)?;
        stack.push(StackEntry::new(node.page_id(), index));
        node = child_of(store, &node, index)?;
    }

    let count = node.count();
    if count == 0 {
        return Ok(None);
    }
    let pos = node.lower_bound(target)?;
    if pos < count {
        stack.push(StackEntry::new(node.page_id(), pos));
        return Ok(Some(stack));
    }

    // target is past this leaf; the answer is the first entry of the next one
    stack.push(StackEntry::new(node.page_id(), count - 1));
    if next(store, &mut stack)? {
        Ok(Some(stack))
    } else {
        Ok(None)
    }
}

/// Moves the stack to the following entry.
///
/// Returns false and leaves the stack untouched at the last entry.
pub(crate) fn next(store: &BlockStore, stack: &mut Vec<StackEntry>) -> Result<bool> {
    let Some(leaf_entry) = stack.last().copied() else {
        return Ok(false);
    };
    let leaf = store.read_node(leaf_entry.page)?;
    if (leaf_entry.offset as usize) + 1 < leaf.count() {
        if let Some(last) = stack.last_mut() {
            last.offset += 1;
        }
        return Ok(true);
    }

    for level in (0..stack.len() - 1).rev() {
        let node = store.read_node(stack[level].page)?;
        let offset = stack[level].offset as usize;
        if offset + 1 < node.count() {
            stack.truncate(level);
            stack.push(StackEntry::new(node.page_id(), offset + 1));
            let child = child_of(store, &node, offset + 1)?;
            descend_edge(store, child, stack, false)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Moves the stack to the preceding entry.
///
/// Returns false and leaves the stack untouched at the first entry.
pub(crate) fn prev(store: &BlockStore, stack: &mut Vec<StackEntry>) -> Result<bool> {
    let Some(leaf_entry) = stack.last().copied() else {
        return Ok(false);
    };
    if leaf_entry.offset > 0 {
        if let Some(last) = stack.last_mut() {
            last.offset -= 1;
        }
        return Ok(true);
    }

    for level in (0..stack.len() - 1).rev() {
        let offset = stack[level].offset as usize;
        if offset > 0 {
            let node = store.read_node(stack[level].page)?;
            stack.truncate(level);
            stack.push(StackEntry::new(node.page_id(), offset - 1));
            let child = child_of(store, &node, offset - 1)?;
            descend_edge(store, child, stack, true)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Key and value of the entry the stack points at.
pub(crate) fn entry_at(store: &BlockStore, stack: &[StackEntry]) -> Result<(Bytes, Bytes)> {
    let leaf_entry = stack
        .last()
        .ok_or_else(|| TabulaError::Internal("empty cursor stack".to_string()))?;
    let leaf = store.read_node(leaf_entry.page)?;
    let offset = leaf_entry.offset as usize;
    Ok((
        Bytes::copy_from_slice(leaf.key(offset)?),
        Bytes::copy_from_slice(leaf.value(offset)?),
    ))
}

/// Approximate path to the entry at fraction `fraction` of the tree.
///
/// Each level picks the child covering the fraction and passes on the
/// remainder, so the result is exact only for a perfectly even tree.
pub(crate) fn set_pos(
    store: &BlockStore,
    tree: &TreeRoot,
    fraction: f64,
) -> Result<Option<Vec<StackEntry>>> {
    let mut f = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    let mut node = store.read_node(tree.root)?;
    if node.count() == 0 {
        return Ok(None);
    }

    let mut stack = Vec::with_capacity(tree.height as usize);
    loop {
        check_depth(&stack)?;
        let count = node.count();
        if count == 0 {
            return Err(TabulaError::IndexCorrupted(format!(
                "empty node {} below the root",
                node.page_id()
            )));
        }
        let scaled = f * count as f64;
        let index = (scaled.floor() as usize).min(count - 1);
        f = (scaled - index as f64).clamp(0.0, 1.0);
        stack.push(StackEntry::new(node.page_id(), index));
        if node.is_leaf() {
            return Ok(Some(stack));
        }
        node = child_of(store, &node, index)?;
    }
}

/// Approximate fraction in [0, 1] of the entry the stack points at.
pub(crate) fn get_pos(store: &BlockStore, stack: &[StackEntry]) -> Result<f64> {
    let mut pos = 0.0;
    let mut scale = 1.0;
    let mut all_last = true;
    for entry in stack {
        let node = store.read_node(entry.page)?;
        let count = node.count().max(1) as f64;
        scale *= count;
        pos += entry.offset as f64 / scale;
        if (entry.offset as usize) + 1 < node.count() {
            all_last = false;
        }
    }
    if all_last {
        return Ok(1.0);
    }
    Ok(pos.clamp(0.0, 1.0))
}

/// Pages along a path, root first.
pub(crate) fn path_pages(stack: &[StackEntry]) -> Vec<PageId> {
    stack.iter().map(|entry| entry.page).collect()
}
