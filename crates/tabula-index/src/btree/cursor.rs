//! Index cursor: a root-to-leaf stack over the tree.
//!
//! A cursor keeps a copy of the entry it points at. After any mutation the
//! index relocates every affected cursor from that copy, so scans survive
//! concurrent inserts and removes.

use super::index::Index;
use super::registry::CursorHandle;
use super::types::{SearchKey, StackEntry};
use super::view;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tabula_common::{PageId, Result, RowId, TabulaError};

/// Where a cursor sits relative to the entries of its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    #[default]
    BeforeFirst,
    Positioned,
    AfterLast,
}

/// Entry a cursor stands in for after another cursor removed its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Removed {
    #[default]
    No,
    /// The stack points at the removed entry's successor.
    AtSuccessor,
    /// The removed entry was the last; the stack points at its predecessor.
    AtPredecessor,
}

/// Mutable position shared between a cursor and the index registry.
#[derive(Debug, Default, Clone)]
pub(crate) struct CursorPosition {
    pub(crate) state: CursorState,
    pub(crate) stack: Vec<StackEntry>,
    pub(crate) key: Bytes,
    pub(crate) value: Bytes,
    /// Set when the entry this cursor pointed at was removed through
    /// another cursor. The next step towards the stand-in entry lands on it
    /// without moving.
    pub(crate) removed: Removed,
    /// Pages pinned in the cache for the current path.
    pub(crate) pins: Vec<PageId>,
}

impl CursorPosition {
    fn park(&mut self, state: CursorState) {
        self.state = state;
        self.stack.clear();
        self.key = Bytes::new();
        self.value = Bytes::new();
        self.removed = Removed::No;
    }
}

/// Traversal handle over one index.
///
/// Dropping the cursor unregisters it and releases its page pins.
pub struct IndexCursor {
    index: Index,
    handle: CursorHandle,
    position: Arc<Mutex<CursorPosition>>,
}

impl IndexCursor {
    pub(crate) fn register(index: Index, position: CursorPosition) -> Result<Self> {
        let position = Arc::new(Mutex::new(position));
        let handle = index.register_cursor(position.clone())?;
        Ok(Self {
            index,
            handle,
            position,
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Registry handle of this cursor.
    pub fn handle(&self) -> CursorHandle {
        self.handle
    }

    /// Moves to `stack`, or to `fallback` when there is none.
    fn place(
        &self,
        position: &mut CursorPosition,
        stack: Option<Vec<StackEntry>>,
        fallback: CursorState,
    ) -> Result<bool> {
        match stack {
            Some(stack) => {
                let (key, value) = view::entry_at(self.index.store(), &stack)?;
                position.state = CursorState::Positioned;
                position.stack = stack;
                position.key = key;
                position.value = value;
                position.removed = Removed::No;
            }
            None => position.park(fallback),
        }
        self.index.repin(position)?;
        Ok(position.state == CursorState::Positioned)
    }

    /// Moves to the first entry. An empty index leaves the cursor after the last.
    pub fn first(&mut self) -> Result<bool> {
        let (_guard, tree) = self.index.read_tree()?;
        let stack = view::descend_first(self.index.store(), &tree)?;
        let mut position = self.position.lock();
        self.place(&mut position, stack, CursorState::AfterLast)
    }

    /// Moves to the last entry. An empty index leaves the cursor after the last.
    pub fn last(&mut self) -> Result<bool> {
        let (_guard, tree) = self.index.read_tree()?;
        let stack = view::descend_last(self.index.store(), &tree)?;
        let mut position = self.position.lock();
        self.place(&mut position, stack, CursorState::AfterLast)
    }

    /// Moves `delta` entries, backwards when negative.
    ///
    /// Returns the number of entries actually moved, signed like `delta`.
    /// Running off either end parks the cursor in the matching terminal
    /// state; a parked cursor ignores `skip` until `first` or `last`. After
    /// another cursor removed this cursor's entry, the first step that would
    /// reach the stand-in entry counts as a move without moving.
    pub fn skip(&mut self, delta: i64) -> Result<i64> {
        let (_guard, _tree) = self.index.read_tree()?;
        let store = self.index.store();
        let mut position = self.position.lock();
        if position.state != CursorState::Positioned || delta == 0 {
            return Ok(0);
        }

        let mut moved = 0i64;
        let removed = std::mem::take(&mut position.removed);
        if delta > 0 {
            let mut remaining = delta;
            if removed == Removed::AtSuccessor {
                remaining -= 1;
                moved += 1;
            }
            while remaining > 0 {
                if !view::next(store, &mut position.stack)? {
                    position.park(CursorState::AfterLast);
                    break;
                }
                remaining -= 1;
                moved += 1;
            }
        } else {
            let mut remaining = delta;
            if removed == Removed::AtPredecessor {
                remaining += 1;
                moved -= 1;
            }
            while remaining < 0 {
                if !view::prev(store, &mut position.stack)? {
                    position.park(CursorState::BeforeFirst);
                    break;
                }
                remaining += 1;
                moved -= 1;
            }
        }

        if position.state == CursorState::Positioned {
            let (key, value) = view::entry_at(store, &position.stack)?;
            position.key = key;
            position.value = value;
        }
        self.index.repin(&mut position)?;
        Ok(moved)
    }

    /// Positions on the first entry whose key starts with `key`.
    ///
    /// With `soft`, a miss lands on the first entry past `key` instead of
    /// after the last. Returns whether an entry matched.
    pub fn seek(&mut self, key: &[u8], soft: bool) -> Result<bool> {
        if key.len() > self.index.key_len() {
            return Err(TabulaError::invalid("seek key length", key.len()));
        }
        let (_guard, tree) = self.index.read_tree()?;
        let stack = view::lower_bound(self.index.store(), &tree, &SearchKey::run_start(key))?;
        let mut position = self.position.lock();
        if !self.place(&mut position, stack, CursorState::AfterLast)? {
            return Ok(false);
        }
        let matched = position.key.starts_with(key);
        if !matched && !soft {
            position.park(CursorState::AfterLast);
            self.index.repin(&mut position)?;
        }
        Ok(matched)
    }

    /// Positions on the exact entry `(key, value)`, or after the last.
    pub(crate) fn seek_entry(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let (_guard, tree) = self.index.read_tree()?;
        let stack = view::lower_bound(self.index.store(), &tree, &SearchKey::exact(key, value))?;
        let mut position = self.position.lock();
        if !self.place(&mut position, stack, CursorState::AfterLast)? {
            return Ok(false);
        }
        if position.key == key && position.value == value {
            return Ok(true);
        }
        position.park(CursorState::AfterLast);
        self.index.repin(&mut position)?;
        Ok(false)
    }

    /// Positions on the first entry of the run sharing `prefix`.
    ///
    /// Leaves the cursor after the last entry if the run is empty.
    pub(crate) fn seek_run_first(&mut self, prefix: &[u8]) -> Result<bool> {
        self.seek(prefix, false)
    }

    /// Positions on the last entry of the run sharing `prefix`.
    ///
    /// Leaves the cursor before the first entry if the run is empty.
    pub(crate) fn seek_run_last(&mut self, prefix: &[u8]) -> Result<bool> {
        if prefix.len() > self.index.key_len() {
            return Err(TabulaError::invalid("seek key length", prefix.len()));
        }
        let (_guard, tree) = self.index.read_tree()?;
        let store = self.index.store();
        let stack = match view::lower_bound(store, &tree, &SearchKey::run_end(prefix))? {
            Some(mut stack) => {
                if view::prev(store, &mut stack)? {
                    Some(stack)
                } else {
                    None
                }
            }
            None => view::descend_last(store, &tree)?,
        };
        let mut position = self.position.lock();
        if self.place(&mut position, stack, CursorState::BeforeFirst)?
            && position.key.starts_with(prefix)
        {
            return Ok(true);
        }
        position.park(CursorState::BeforeFirst);
        self.index.repin(&mut position)?;
        Ok(false)
    }

    pub(crate) fn park_after_last(&mut self) -> Result<()> {
        let (_guard, _tree) = self.index.read_tree()?;
        let mut position = self.position.lock();
        position.park(CursorState::AfterLast);
        self.index.repin(&mut position)
    }

    /// Moves to the approximate fraction `fraction` of the index.
    pub fn set_pos(&mut self, fraction: f64) -> Result<bool> {
        let (_guard, tree) = self.index.read_tree()?;
        let stack = view::set_pos(self.index.store(), &tree, fraction)?;
        let mut position = self.position.lock();
        self.place(&mut position, stack, CursorState::AfterLast)
    }

    /// Approximate fraction of the index before this cursor.
    pub fn get_pos(&self) -> Result<f64> {
        let (_guard, _tree) = self.index.read_tree()?;
        let position = self.position.lock();
        match position.state {
            CursorState::BeforeFirst => Ok(0.0),
            CursorState::AfterLast => Ok(1.0),
            CursorState::Positioned => view::get_pos(self.index.store(), &position.stack),
        }
    }

    pub fn state(&self) -> CursorState {
        self.position.lock().state
    }

    pub fn is_bof(&self) -> bool {
        self.state() == CursorState::BeforeFirst
    }

    pub fn is_eof(&self) -> bool {
        self.state() == CursorState::AfterLast
    }

    /// Key at the cursor, None unless positioned.
    pub fn key(&self) -> Option<Bytes> {
        let position = self.position.lock();
        (position.state == CursorState::Positioned).then(|| position.key.clone())
    }

    /// Value at the cursor, None unless positioned.
    pub fn value(&self) -> Option<Bytes> {
        let position = self.position.lock();
        (position.state == CursorState::Positioned).then(|| position.value.clone())
    }

    /// Value decoded as a big-endian row id.
    pub fn row_id(&self) -> Option<RowId> {
        let value = self.value()?;
        (value.len() <= 8).then(|| RowId::from_be_bytes(&value))
    }

    /// Key and value of the entry the cursor expects to visit, removed or not.
    pub(crate) fn entry(&self) -> Option<(Bytes, Bytes, bool)> {
        let position = self.position.lock();
        (position.state == CursorState::Positioned).then(|| {
            (
                position.key.clone(),
                position.value.clone(),
                position.removed != Removed::No,
            )
        })
    }

    /// Opens an independent cursor at the same position.
    pub fn try_clone(&self) -> Result<IndexCursor> {
        let (_guard, _tree) = self.index.read_tree()?;
        let mut copy = self.position.lock().clone();
        copy.pins.clear();
        self.index.repin(&mut copy)?;
        IndexCursor::register(self.index.clone(), copy)
    }
}

impl Drop for IndexCursor {
    fn drop(&mut self) {
        self.index.unregister_cursor(self.handle);
        let mut position = self.position.lock();
        for page in position.pins.drain(..) {
            self.index.store().unpin(page);
        }
    }
}

impl std::fmt::Debug for IndexCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let position = self.position.lock();
        f.debug_struct("IndexCursor")
            .field("handle", &self.handle)
            .field("state", &position.state)
            .field("depth", &position.stack.len())
            .finish()
    }
}
