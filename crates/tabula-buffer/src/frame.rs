//! Cache frames holding a single index page.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tabula_common::PageId;

/// Sentinel value indicating no page is loaded in the frame.
const NO_PAGE: u64 = u64::MAX;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding one page image.
///
/// The frame size is fixed when the pool is built and matches the page size
/// of the index file it caches. Pins are only taken while the pool state lock
/// is held, so a frame with a zero pin count observed under that lock cannot
/// be pinned concurrently.
pub struct BufferFrame {
    frame_id: FrameId,
    /// Resident page number, NO_PAGE when empty.
    page_id: AtomicU64,
    data: RwLock<Box<[u8]>>,
    pin_count: AtomicU32,
}

impl BufferFrame {
    /// Creates a new empty buffer frame of `page_size` bytes.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(NO_PAGE),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.page_id.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageId(packed as u32))
        }
    }

    #[inline]
    pub(crate) fn set_page_id(&self, page_id: Option<PageId>) {
        let packed = match page_id {
            Some(pid) => pid.0 as u64,
            None => NO_PAGE,
        };
        self.page_id.store(packed, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous value.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count, saturating at zero. Returns the new count.
    #[inline]
    pub(crate) fn unpin(&self) -> u32 {
        let result = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match result {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id.load(Ordering::Acquire) == NO_PAGE
    }

    /// Size of the page image in bytes.
    pub fn page_size(&self) -> usize {
        self.data.read().len()
    }

    /// Reads the page data.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Copies `src` into the frame. Bytes past the end of `src` are left as-is.
    #[inline]
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(data.len());
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Copies the page image out of the frame.
    pub fn to_boxed(&self) -> Box<[u8]> {
        self.data.read().clone()
    }

    /// Resets the frame to empty state.
    pub(crate) fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_validity() {
        assert!(FrameId(0).is_valid());
        assert!(!FrameId::INVALID.is_valid());
        assert_eq!(FrameId(42).to_string(), "frame:42");
    }

    #[test]
    fn test_buffer_frame_new() {
        let frame = BufferFrame::new(FrameId(0), 1024);

        assert_eq!(frame.frame_id(), FrameId(0));
        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert!(frame.is_empty());
        assert_eq!(frame.page_size(), 1024);
    }

    #[test]
    fn test_buffer_frame_pin_unpin() {
        let frame = BufferFrame::new(FrameId(0), 512);

        assert_eq!(frame.pin(), 0);
        assert_eq!(frame.pin(), 1);
        assert!(frame.is_pinned());

        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());

        // saturates at zero
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_buffer_frame_page_id() {
        let frame = BufferFrame::new(FrameId(0), 512);

        frame.set_page_id(Some(PageId(100)));
        assert_eq!(frame.page_id(), Some(PageId(100)));
        assert!(!frame.is_empty());

        // page 0 is a valid resident page, distinct from empty
        frame.set_page_id(Some(PageId(0)));
        assert_eq!(frame.page_id(), Some(PageId(0)));

        frame.set_page_id(None);
        assert!(frame.is_empty());
    }

    #[test]
    fn test_buffer_frame_copy() {
        let frame = BufferFrame::new(FrameId(0), 512);
        frame.copy_from(&[1u8, 2, 3, 4, 5]);

        let image = frame.to_boxed();
        assert_eq!(image.len(), 512);
        assert_eq!(&image[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(image[5], 0);
    }

    #[test]
    fn test_buffer_frame_copy_truncates_oversized_source() {
        let frame = BufferFrame::new(FrameId(0), 512);
        frame.copy_from(&vec![7u8; 600]);
        assert_eq!(frame.read_data().len(), 512);
        assert!(frame.read_data().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_buffer_frame_reset() {
        let frame = BufferFrame::new(FrameId(3), 512);
        frame.set_page_id(Some(PageId(9)));
        frame.pin();
        frame.copy_from(&[0xFF]);

        frame.reset();

        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert_eq!(frame.read_data()[0], 0);
    }

    #[test]
    fn test_buffer_frame_debug() {
        let frame = BufferFrame::new(FrameId(5), 512);
        frame.set_page_id(Some(PageId(10)));
        let debug_str = format!("{:?}", frame);
        assert!(debug_str.contains("BufferFrame"));
        assert!(debug_str.contains("pin_count"));
    }
}
