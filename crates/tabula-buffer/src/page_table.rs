//! Page table mapping resident page numbers to frames.

use crate::frame::FrameId;
use std::collections::HashMap;
use tabula_common::PageId;

/// Pages below this number are looked up through a flat array.
const DIRECT_PATH_SIZE: usize = 16384;

/// Sentinel value for empty slots in the direct path.
const EMPTY_FRAME: u32 = u32::MAX;

/// Two-tier page table.
///
/// Low page numbers (the upper tree levels and most small indexes) resolve
/// through a direct array; everything else goes through a hash map. The
/// table is owned by the pool state and guarded by the pool lock.
pub struct PageTable {
    direct_path: Vec<u32>,
    overflow: HashMap<u32, FrameId>,
    len: usize,
}

impl PageTable {
    /// Creates a page table sized for `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let direct = DIRECT_PATH_SIZE.min(capacity.saturating_mul(4).max(64));
        Self {
            direct_path: vec![EMPTY_FRAME; direct],
            overflow: HashMap::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        let num = page_id.0 as usize;
        if num < self.direct_path.len() {
            let val = self.direct_path[num];
            return (val != EMPTY_FRAME).then_some(FrameId(val));
        }
        self.overflow.get(&page_id.0).copied()
    }

    /// Inserts a mapping, returning the previous frame if there was one.
    pub fn insert(&mut self, page_id: PageId, frame_id: FrameId) -> Option<FrameId> {
        let num = page_id.0 as usize;
        let prev = if num < self.direct_path.len() {
            let old = std::mem::replace(&mut self.direct_path[num], frame_id.0);
            (old != EMPTY_FRAME).then_some(FrameId(old))
        } else {
            self.overflow.insert(page_id.0, frame_id)
        };
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    /// Removes a mapping, returning its frame.
    pub fn remove(&mut self, page_id: PageId) -> Option<FrameId> {
        let num = page_id.0 as usize;
        let prev = if num < self.direct_path.len() {
            let old = std::mem::replace(&mut self.direct_path[num], EMPTY_FRAME);
            (old != EMPTY_FRAME).then_some(FrameId(old))
        } else {
            self.overflow.remove(&page_id.0)
        };
        if prev.is_some() {
            self.len -= 1;
        }
        prev
    }

    #[inline]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.get(page_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Calls `f` for every mapping. Stops early when `f` returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId) -> bool,
    {
        for (num, &val) in self.direct_path.iter().enumerate() {
            if val != EMPTY_FRAME && !f(PageId(num as u32), FrameId(val)) {
                return;
            }
        }
        for (&num, &frame_id) in &self.overflow {
            if !f(PageId(num), frame_id) {
                return;
            }
        }
    }
}
