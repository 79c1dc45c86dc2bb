//! Bottom-up bulk load of an empty tree from sorted records.

use super::node::{Node, NodeLayout};
use super::store::{BlockStore, TreeRoot};
use crate::keypool::KeyPool;
use crate::progress::ProgressSink;
use bytes::Bytes;
use tabula_common::{PageId, Result, TabulaError};
use tracing::debug;

/// Splits `total` items into `parts` groups whose sizes differ by at most one.
fn group_sizes(total: u64, parts: u64) -> impl Iterator<Item = usize> {
    let base = total / parts;
    let extra = total % parts;
    (0..parts).map(move |i| (base + u64::from(i < extra)) as usize)
}

fn node_count(total: u64, capacity: usize) -> u64 {
    total.div_ceil(capacity as u64).max(1)
}

/// Rejects a record that repeats the previous one.
fn check_duplicate(layout: &NodeLayout, previous: &[u8], record: &[u8]) -> Result<()> {
    let same = if layout.allow_duplicates {
        previous == record
    } else {
        previous[..layout.key_len] == record[..layout.key_len]
    };
    if same {
        return Err(TabulaError::DuplicateKey);
    }
    Ok(())
}

fn report(progress: &mut dyn ProgressSink, done: u64, total: u64) -> Result<()> {
    let mut cancel = false;
    progress.update_progress(done, total, &mut cancel);
    if cancel {
        return Err(TabulaError::BuildCancelled);
    }
    Ok(())
}

/// Builds a tree from the pool's records and makes it the root.
///
/// `tree` must be empty. Leaves are filled evenly, then each internal level
/// is built over the first entries of the level below. The header is
/// written last and the old root leaf freed after it. On error the file may
/// hold unreachable pages; the caller resets it.
pub(crate) fn load(
    store: &BlockStore,
    tree: &TreeRoot,
    pool: KeyPool,
    progress: &mut dyn ProgressSink,
    interval: u64,
) -> Result<TreeRoot> {
    let total = pool.len();
    let records = pool.into_sorted(&mut || report(progress, 0, total))?;
    if total == 0 {
        report(progress, 0, 0)?;
        return Ok(*tree);
    }

    let layout = *store.layout();
    let capacity = layout.capacity();
    let mut level: Vec<(PageId, Bytes)> = Vec::new();
    let mut records = records.peekable();
    let mut previous: Option<Vec<u8>> = None;
    let mut done = 0u64;

    for size in group_sizes(total, node_count(total, capacity)) {
        let page = store.allocate_pages(1)?[0];
        let mut leaf = Node::new(page, layout, 0);
        for _ in 0..size {
            let record = records.next().ok_or_else(|| {
                TabulaError::Internal(format!("sorted stream ended after {} of {} records", done, total))
            })??;
            if let Some(previous) = &previous {
                check_duplicate(&layout, previous, &record)?;
            }
            leaf.push(PageId::NULL, &record)?;
            previous = Some(record);
            done += 1;
            if done % interval == 0 {
                report(progress, done, total)?;
            }
        }
        store.write_node(&leaf)?;
        level.push((page, Bytes::copy_from_slice(leaf.entry(0)?)));
    }
    if records.peek().is_some() {
        return Err(TabulaError::Internal(format!(
            "sorted stream holds more than {} records",
            total
        )));
    }
    debug!(leaves = level.len(), entries = total, "bulk leaf level written");

    let mut height = 1u16;
    while level.len() > 1 {
        let children = level.len() as u64;
        let mut upper = Vec::with_capacity(node_count(children, capacity) as usize);
        let mut slots = level.into_iter();
        for size in group_sizes(children, node_count(children, capacity)) {
            let page = store.allocate_pages(1)?[0];
            let mut node = Node::new(page, layout, height);
            for (child, first) in slots.by_ref().take(size) {
                node.push(child, &first)?;
            }
            store.write_node(&node)?;
            upper.push((page, Bytes::copy_from_slice(node.entry(0)?)));
        }
        level = upper;
        height += 1;
        debug!(nodes = level.len(), height, "bulk internal level written");
    }

    let loaded = TreeRoot {
        root: level[0].0,
        height,
        entries: total,
    };
    store.write_header(&loaded)?;
    store.free_page(tree.root)?;
    store.write_header(&loaded)?;
    report(progress, total, total)?;
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_sizes_are_even() {
        let sizes: Vec<usize> = group_sizes(10, 3).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(group_sizes(10, 3).sum::<usize>(), 10);
        let sizes: Vec<usize> = group_sizes(84, 2).collect();
        assert_eq!(sizes, vec![42, 42]);
    }

    #[test]
    fn test_node_count() {
        assert_eq!(node_count(0, 42), 1);
        assert_eq!(node_count(42, 42), 1);
        assert_eq!(node_count(43, 42), 2);
    }

    #[test]
    fn test_check_duplicate_modes() {
        let unique = NodeLayout::new(512, 2, 1, false).unwrap();
        let dups = NodeLayout { allow_duplicates: true, ..unique };
        assert!(check_duplicate(&unique, b"ab\x01", b"ab\x02").is_err());
        assert!(check_duplicate(&dups, b"ab\x01", b"ab\x02").is_ok());
        assert!(check_duplicate(&dups, b"ab\x01", b"ab\x01").is_err());
    }
}
