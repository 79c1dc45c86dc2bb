//! Disk-resident B-tree index with live cursor repositioning.
//!
//! Every mutation runs under the exclusive tree lock and, before the lock is
//! released, relocates each registered cursor whose path it touched.

use super::bulk;
use super::cursor::{CursorPosition, CursorState, IndexCursor, Removed};
use super::node::NodeLayout;
use super::registry::{CursorHandle, CursorRegistry};
use super::store::{BlockStore, TreeRoot};
use super::tree;
use super::types::{ModInfo, ModKind, SearchKey, TreeStats};
use super::view;
use crate::keypool::KeyPool;
use crate::progress::ProgressSink;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabula_buffer::BufferPoolStats;
use tabula_common::{IndexConfig, PageId, Result, TabulaError};
use tracing::{debug, info, warn};

pub(crate) struct IndexInner {
    store: BlockStore,
    /// Serializes mutations against each other and against cursor moves.
    tree_lock: RwLock<()>,
    /// Root pointer, swapped while the tree lock is held exclusively.
    root: RwLock<TreeRoot>,
    registry: Mutex<CursorRegistry>,
    bulk: Mutex<Option<KeyPool>>,
    held: Mutex<Vec<PageId>>,
    closed: AtomicBool,
    config: IndexConfig,
}

impl Drop for IndexInner {
    fn drop(&mut self) {
        for page in self.held.get_mut().drain(..) {
            self.store.unpin(page);
        }
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.store.sync() {
                warn!(path = %self.store.path().display(), error = %e, "index sync on drop failed");
            }
        }
    }
}

/// Shared handle to an open index file.
///
/// Clones refer to the same index. The file stays open until the last
/// handle and the last cursor are dropped.
#[derive(Clone)]
pub struct Index {
    inner: Arc<IndexInner>,
}

impl Index {
    fn from_parts(store: BlockStore, tree: TreeRoot, config: IndexConfig) -> Self {
        Self {
            inner: Arc::new(IndexInner {
                store,
                tree_lock: RwLock::new(()),
                root: RwLock::new(tree),
                registry: Mutex::new(CursorRegistry::default()),
                bulk: Mutex::new(None),
                held: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Creates a new, empty index file. Fails if `path` exists.
    pub fn create(
        path: &Path,
        key_len: usize,
        value_len: usize,
        allow_duplicates: bool,
        config: IndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        let layout = NodeLayout::new(config.page_size, key_len, value_len, allow_duplicates)?;
        let (store, tree) = BlockStore::create(path, layout, &config)?;
        info!(
            path = %path.display(),
            key_len,
            value_len,
            allow_duplicates,
            capacity = layout.capacity(),
            "index created"
        );
        Ok(Self::from_parts(store, tree, config))
    }

    /// Opens an existing index file.
    pub fn open(path: &Path, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let (store, header) = BlockStore::open(path, &config)?;
        info!(
            path = %path.display(),
            entries = header.tree.entries,
            height = header.tree.height,
            "index opened"
        );
        Ok(Self::from_parts(store, header.tree, config))
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TabulaError::invalid("index", "closed"));
        }
        Ok(())
    }

    /// Marks the index closed and syncs it. Later calls fail with
    /// `InvalidParameter`; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let _guard = self.inner.tree_lock.write();
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.bulk.lock().take();
        self.release_hold();
        self.inner.store.sync()?;
        info!(path = %self.inner.store.path().display(), "index closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Makes every completed mutation durable.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.inner.tree_lock.read();
        self.inner.store.sync()
    }

    pub fn path(&self) -> &Path {
        self.inner.store.path()
    }

    pub fn key_len(&self) -> usize {
        self.inner.store.layout().key_len
    }

    pub fn value_len(&self) -> usize {
        self.inner.store.layout().value_len
    }

    pub fn allow_duplicates(&self) -> bool {
        self.inner.store.layout().allow_duplicates
    }

    pub fn config(&self) -> &IndexConfig {
        &self.inner.config
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.inner.root.read().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of node levels; 1 while the root is a leaf.
    pub fn height(&self) -> u16 {
        self.inner.root.read().height
    }

    pub fn cache_stats(&self) -> BufferPoolStats {
        self.inner.store.cache_stats()
    }

    /// Number of live cursors on this index.
    pub fn open_cursors(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub(crate) fn store(&self) -> &BlockStore {
        &self.inner.store
    }

    pub(crate) fn same_index(&self, other: &Index) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Shared tree lock plus the root it protects.
    pub(crate) fn read_tree(&self) -> Result<(RwLockReadGuard<'_, ()>, TreeRoot)> {
        self.check_open()?;
        let guard = self.inner.tree_lock.read();
        let tree = *self.inner.root.read();
        Ok((guard, tree))
    }

    pub(crate) fn register_cursor(
        &self,
        position: Arc<Mutex<CursorPosition>>,
    ) -> Result<CursorHandle> {
        self.check_open()?;
        Ok(self.inner.registry.lock().register(position))
    }

    pub(crate) fn unregister_cursor(&self, handle: CursorHandle) {
        self.inner.registry.lock().unregister(handle);
    }

    /// Pins the pages on the position's path and releases the rest.
    pub(crate) fn repin(&self, position: &mut CursorPosition) -> Result<()> {
        let wanted = if position.state == CursorState::Positioned {
            view::path_pages(&position.stack)
        } else {
            Vec::new()
        };
        let mut pins = Vec::with_capacity(wanted.len());
        for page in wanted {
            if position.pins.contains(&page) || self.inner.store.pin(page)? {
                pins.push(page);
            }
        }
        for page in &position.pins {
            if !pins.contains(page) {
                self.inner.store.unpin(*page);
            }
        }
        position.pins = pins;
        Ok(())
    }

    /// Opens a cursor positioned before the first entry.
    pub fn cursor(&self) -> Result<IndexCursor> {
        IndexCursor::register(self.clone(), CursorPosition::default())
    }

    /// Opens a cursor on the first entry whose key starts with `key`.
    ///
    /// Without `soft` a miss leaves the cursor after the last entry; with
    /// it the cursor lands on the first entry past `key`.
    pub fn seek(&self, key: &[u8], soft: bool) -> Result<IndexCursor> {
        let mut cursor = self.cursor()?;
        cursor.seek(key, soft)?;
        Ok(cursor)
    }

    /// Inserts one entry.
    ///
    /// Fails with `DuplicateKey` when the key exists in a unique index, or
    /// the exact entry exists in an index with duplicates.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        let _guard = self.inner.tree_lock.write();
        self.insert_locked(key, value)
    }

    fn insert_locked(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tree = *self.inner.root.read();
        let info = tree::insert_entry(&self.inner.store, &mut tree, key, value)?;
        if info.kind != ModKind::Insert {
            debug!(kind = ?info.kind, pages = info.pages.len(), height = tree.height, "tree reshaped by insert");
        }
        *self.inner.root.write() = tree;
        self.notify(&tree, &info)
    }

    /// Removes the entry under `cursor`.
    ///
    /// Returns false when the cursor is not on an entry. Afterwards the
    /// cursor sits on the removed entry's successor, or after the last.
    pub fn remove(&self, cursor: &IndexCursor) -> Result<bool> {
        self.check_open()?;
        if !self.same_index(cursor.index()) {
            return Err(TabulaError::invalid("cursor", "opened on another index"));
        }
        let _guard = self.inner.tree_lock.write();
        let Some((key, value, removed)) = cursor.entry() else {
            return Ok(false);
        };
        if removed {
            // the cursor's own entry is already gone
            return Ok(false);
        }

        let mut tree = *self.inner.root.read();
        let Some(mut info) = tree::remove_entry(&self.inner.store, &mut tree, &key, &value)? else {
            return Ok(false);
        };
        if info.kind != ModKind::Remove {
            debug!(kind = ?info.kind, pages = info.pages.len(), height = tree.height, "tree reshaped by remove");
        }
        info.origin = Some(cursor.handle());
        *self.inner.root.write() = tree;
        self.notify(&tree, &info)?;
        Ok(true)
    }

    /// Relocates every cursor the change touched. Runs under the exclusive
    /// tree lock.
    fn notify(&self, tree: &TreeRoot, info: &ModInfo) -> Result<()> {
        let registry = self.inner.registry.lock();
        for (handle, position) in registry.iter_live() {
            let mut position = position.lock();
            if position.state != CursorState::Positioned || !info.affects(&position.stack) {
                continue;
            }
            self.relocate(tree, &mut position, info.origin == Some(handle))?;
        }
        Ok(())
    }

    fn relocate(&self, tree: &TreeRoot, position: &mut CursorPosition, is_origin: bool) -> Result<()> {
        let store = &self.inner.store;
        let target = SearchKey::exact(&position.key, &position.value);
        match view::lower_bound(store, tree, &target)? {
            Some(stack) => {
                let (key, value) = view::entry_at(store, &stack)?;
                let moved = key != position.key || value != position.value;
                position.stack = stack;
                if moved {
                    position.key = key;
                    position.value = value;
                    if !is_origin {
                        position.removed = Removed::AtSuccessor;
                    }
                }
            }
            None => match view::descend_last(store, tree)? {
                Some(stack) if !is_origin => {
                    let (key, value) = view::entry_at(store, &stack)?;
                    position.stack = stack;
                    position.key = key;
                    position.value = value;
                    position.removed = Removed::AtPredecessor;
                }
                _ => {
                    position.state = CursorState::AfterLast;
                    position.stack.clear();
                    position.removed = Removed::No;
                }
            },
        }
        self.repin(position)
    }

    /// Enters bulk mode. `estimate` sizes the first in-memory run.
    pub fn start_bulk_insert(&self, estimate: u64) -> Result<()> {
        self.check_open()?;
        let mut bulk = self.inner.bulk.lock();
        if bulk.is_some() {
            return Err(TabulaError::invalid("bulk insert", "already started"));
        }
        let dir = match &self.inner.config.bulk.temp_dir {
            Some(dir) => dir.clone(),
            None => self
                .path()
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| std::path::PathBuf::from(".")),
        };
        let layout = self.inner.store.layout();
        *bulk = Some(KeyPool::new(
            layout.key_len,
            layout.value_len,
            &self.inner.config.bulk,
            &dir,
            estimate,
        )?);
        Ok(())
    }

    /// Buffers one entry for the pending bulk load.
    pub fn insert_during_bulk(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut bulk = self.inner.bulk.lock();
        let pool = bulk
            .as_mut()
            .ok_or_else(|| TabulaError::invalid("bulk insert", "not started"))?;
        pool.push(key, value)
    }

    /// Leaves bulk mode, discarding buffered entries and spilled runs.
    pub fn cancel_bulk_insert(&self) {
        if let Some(pool) = self.inner.bulk.lock().take() {
            debug!(entries = pool.len(), runs = pool.run_count(), "bulk insert cancelled");
        }
    }

    pub fn in_bulk_insert(&self) -> bool {
        self.inner.bulk.lock().is_some()
    }

    /// Sorts the buffered entries and loads them.
    ///
    /// An empty index is built bottom-up; otherwise the entries are inserted
    /// one by one. Returns the number of entries loaded. When the sink
    /// cancels an empty-index build, the index is left empty and the error
    /// is `BuildCancelled`.
    pub fn finish_bulk_insert(&self, progress: &mut dyn ProgressSink) -> Result<u64> {
        self.check_open()?;
        let pool = self
            .inner
            .bulk
            .lock()
            .take()
            .ok_or_else(|| TabulaError::invalid("bulk insert", "not started"))?;
        let _guard = self.inner.tree_lock.write();
        let tree = *self.inner.root.read();
        let total = pool.len();
        let interval = self.inner.config.bulk.progress_interval;

        if tree.entries > 0 {
            return self.merge_into_existing(pool, progress);
        }

        match bulk::load(&self.inner.store, &tree, pool, progress, interval) {
            Ok(loaded) => {
                *self.inner.root.write() = loaded;
                self.notify(&loaded, &ModInfo::bulk_load())?;
                info!(
                    path = %self.path().display(),
                    entries = loaded.entries,
                    height = loaded.height,
                    "bulk load finished"
                );
                Ok(total)
            }
            Err(e) => {
                let empty = self.inner.store.truncate_to_empty()?;
                *self.inner.root.write() = empty;
                self.notify(&empty, &ModInfo::bulk_load())?;
                warn!(path = %self.path().display(), error = %e, "bulk load abandoned");
                Err(e)
            }
        }
    }

    fn merge_into_existing(&self, pool: KeyPool, progress: &mut dyn ProgressSink) -> Result<u64> {
        let total = pool.len();
        let interval = self.inner.config.bulk.progress_interval;
        let key_len = self.key_len();
        let mut cancel = false;
        let records = pool.into_sorted(&mut || {
            progress.update_progress(0, total, &mut cancel);
            if cancel {
                Err(TabulaError::BuildCancelled)
            } else {
                Ok(())
            }
        })?;

        let mut done = 0u64;
        for record in records {
            let record = record?;
            let (key, value) = record.split_at(key_len);
            self.insert_locked(key, value)?;
            done += 1;
            if done % interval == 0 {
                progress.update_progress(done, total, &mut cancel);
                if cancel {
                    return Err(TabulaError::BuildCancelled);
                }
            }
        }
        progress.update_progress(done, total, &mut cancel);
        info!(path = %self.path().display(), entries = done, "bulk entries merged into existing index");
        Ok(done)
    }

    /// Pins the top `levels` levels of the tree, breadth first, up to
    /// `max_hold_pages` pages. The pins last until the returned guard is
    /// dropped or `release_hold` is called. On error no page stays pinned.
    pub fn hold(&self, levels: u16) -> Result<CacheHold> {
        let (_guard, tree) = self.read_tree()?;
        let limit = self.inner.config.max_hold_pages;
        let store = &self.inner.store;

        let mut hold = CacheHold {
            index: self.clone(),
            pages: Vec::new(),
        };
        let mut queue = VecDeque::from([(tree.root, 0u16)]);
        while let Some((page, depth)) = queue.pop_front() {
            if depth >= levels || hold.pages.len() >= limit {
                break;
            }
            let node = store.read_node(page)?;
            if !store.pin(page)? {
                break;
            }
            self.inner.held.lock().push(page);
            hold.pages.push(page);
            if !node.is_leaf() {
                for i in 0..node.count() {
                    queue.push_back((node.branch(i)?, depth + 1));
                }
            }
        }

        debug!(levels, pages = hold.pages.len(), "tree levels held in cache");
        Ok(hold)
    }

    /// Releases every page pinned by `hold`.
    pub fn release_hold(&self) {
        let mut held = self.inner.held.lock();
        for page in held.drain(..) {
            self.inner.store.unpin(page);
        }
    }

    fn release_pages(&self, pages: &[PageId]) {
        let mut held = self.inner.held.lock();
        for page in pages {
            if let Some(i) = held.iter().position(|p| p == page) {
                held.swap_remove(i);
                self.inner.store.unpin(*page);
            }
        }
    }

    /// Walks the whole tree checking order, separators, fill and depth.
    pub fn verify(&self) -> Result<TreeStats> {
        let (_guard, tree) = self.read_tree()?;
        tree::verify(&self.inner.store, &tree)
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = *self.inner.root.read();
        f.debug_struct("Index")
            .field("path", &self.path())
            .field("entries", &tree.entries)
            .field("height", &tree.height)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pages pinned by `Index::hold`, released on drop.
pub struct CacheHold {
    index: Index,
    pages: Vec<PageId>,
}

impl CacheHold {
    /// Number of pages this hold pinned.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for CacheHold {
    fn drop(&mut self) {
        self.index.release_pages(&self.pages);
    }
}
