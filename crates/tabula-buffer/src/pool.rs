//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, Replacer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::System;
use tabula_common::page::DEFAULT_PAGE_SIZE;
use tabula_common::{PageId, Result, TabulaError};
use tracing::{debug, trace};

/// Smallest pool `auto_sized` will build.
const MIN_AUTO_FRAMES: usize = 256;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Size of every frame in bytes.
    pub page_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Mutable pool bookkeeping, guarded by a single lock.
struct PoolState {
    page_table: PageTable,
    free_list: Vec<FrameId>,
    replacer: ClockReplacer,
}

/// Write-through page cache.
///
/// The pool never owns the only copy of a page: callers write the file first
/// and then refresh the cached image with `load_page`. Eviction therefore
/// never produces write-back work. Pinned frames are never evicted, which is
/// what lets cursors and `hold` keep hot pages resident.
pub struct BufferPool {
    config: BufferPoolConfig,
    frames: Vec<BufferFrame>,
    state: Mutex<PoolState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames.max(1);
        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32), config.page_size))
            .collect();
        // pop() hands out low frame ids first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config: BufferPoolConfig {
                num_frames,
                page_size: config.page_size,
            },
            frames,
            state: Mutex::new(PoolState {
                page_table: PageTable::new(num_frames),
                free_list,
                replacer: ClockReplacer::new(num_frames),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a pool sized to one eighth of available system memory.
    pub fn auto_sized(page_size: usize) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let num_frames = (available_bytes / 8 / page_size.max(1)).max(MIN_AUTO_FRAMES);
        debug!(num_frames, page_size, "auto-sized page cache");

        Self::new(BufferPoolConfig {
            num_frames,
            page_size,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains(page_id)
    }

    /// Fetches a resident page and pins it.
    ///
    /// Returns None on a cache miss.
    #[inline]
    pub fn fetch_page(&self, page_id: PageId) -> Option<&BufferFrame> {
        let mut state = self.state.lock();
        match state.page_table.get(page_id) {
            Some(frame_id) => {
                let frame = &self.frames[frame_id.0 as usize];
                frame.pin();
                state.replacer.record_access(frame_id);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Finds a frame for a new page: free list first, then eviction.
    fn allocate_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }

        let frames = &self.frames;
        let victim = state
            .replacer
            .evict(&|fid| frames[fid.0 as usize].pin_count() == 0);

        match victim {
            Some(victim_id) => {
                let frame = &self.frames[victim_id.0 as usize];
                if let Some(old_page_id) = frame.page_id() {
                    state.page_table.remove(old_page_id);
                    trace!(page = %old_page_id, frame = %victim_id, "evicted page");
                }
                self.evictions.fetch_add(1, Ordering::Relaxed);
                Ok(victim_id)
            }
            None => Err(TabulaError::BufferPoolFull),
        }
    }

    /// Installs a page image in the pool and pins it.
    ///
    /// If the page is already resident its image is replaced. Fails with
    /// `BufferPoolFull` when every frame is pinned.
    pub fn load_page(&self, page_id: PageId, data: &[u8]) -> Result<&BufferFrame> {
        let mut state = self.state.lock();

        if let Some(frame_id) = state.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.copy_from(data);
            frame.pin();
            state.replacer.record_access(frame_id);
            return Ok(frame);
        }

        let frame_id = self.allocate_frame(&mut state)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.copy_from(data);
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        state.replacer.insert(frame_id);
        Ok(frame)
    }

    /// Refreshes the image of a resident page without pinning it.
    ///
    /// Returns false if the page is not resident.
    pub fn update_page(&self, page_id: PageId, data: &[u8]) -> bool {
        let state = self.state.lock();
        match state.page_table.get(page_id) {
            Some(frame_id) => {
                self.frames[frame_id.0 as usize].copy_from(data);
                true
            }
            None => false,
        }
    }

    /// Unpins a page. Returns false if the page is not resident.
    #[inline]
    pub fn unpin_page(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        if let Some(frame_id) = state.page_table.get(page_id) {
            self.frames[frame_id.0 as usize].unpin();
            return true;
        }
        false
    }

    /// Pins a batch of resident pages. Returns the pages that were pinned.
    pub fn batch_pin(&self, page_ids: &[PageId]) -> Vec<PageId> {
        let mut state = self.state.lock();
        let mut pinned = Vec::with_capacity(page_ids.len());
        for &pid in page_ids {
            if let Some(frame_id) = state.page_table.get(pid) {
                self.frames[frame_id.0 as usize].pin();
                state.replacer.record_access(frame_id);
                pinned.push(pid);
            }
        }
        pinned
    }

    /// Unpins a batch of pages.
    pub fn batch_unpin(&self, page_ids: &[PageId]) {
        let state = self.state.lock();
        for &pid in page_ids {
            if let Some(frame_id) = state.page_table.get(pid) {
                self.frames[frame_id.0 as usize].unpin();
            }
        }
    }

    /// Drops a page from the pool.
    ///
    /// Returns false if the page is pinned or not resident.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();
        let Some(frame_id) = state.page_table.get(page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_pinned() {
            return false;
        }
        state.page_table.remove(page_id);
        state.replacer.remove(frame_id);
        frame.reset();
        state.free_list.push(frame_id);
        true
    }

    /// Drops every unpinned page. Returns the number of pages dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let mut victims = Vec::new();
        state.page_table.for_each(|page_id, frame_id| {
            if !self.frames[frame_id.0 as usize].is_pinned() {
                victims.push((page_id, frame_id));
            }
            true
        });
        for &(page_id, frame_id) in &victims {
            state.page_table.remove(page_id);
            state.replacer.remove(frame_id);
            self.frames[frame_id.0 as usize].reset();
            state.free_list.push(frame_id);
        }
        victims.len()
    }

    /// Returns a pinned read guard for a resident page.
    pub fn read_page(&self, page_id: PageId) -> Option<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Some(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        state.page_table.for_each(|_, frame_id| {
            if self.frames[frame_id.0 as usize].is_pinned() {
                pinned_frames += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Lookups served from the pool.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Pages evicted to make room.
    pub evictions: u64,
}

impl BufferPoolStats {
    /// Fraction of lookups served from the pool.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// RAII guard for reading a pinned page.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageReadGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.read_data()
    }

    /// Copies the page image out.
    pub fn to_boxed(&self) -> Box<[u8]> {
        self.frame.to_boxed()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id);
    }
}
