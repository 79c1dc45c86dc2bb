//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;

/// Trait for page replacement algorithms.
///
/// Implementations are owned by the pool state and called with the pool lock
/// held, so they take `&mut self` and need no interior locking.
pub trait Replacer: Send {
    /// Starts tracking a frame that just received a page.
    fn insert(&mut self, frame_id: FrameId);

    /// Records that the given frame was accessed.
    fn record_access(&mut self, frame_id: FrameId);

    /// Selects a victim among tracked frames for which `is_evictable` holds.
    ///
    /// The victim stops being tracked. Returns None if no frame qualifies.
    fn evict(&mut self, is_evictable: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Stops tracking a frame.
    fn remove(&mut self, frame_id: FrameId);

    /// Returns the number of tracked frames.
    fn size(&self) -> usize;
}

/// Clock (second chance) replacement.
///
/// Frames sit on a circular buffer with a reference bit. The hand clears set
/// bits as it passes and picks the first evictable frame whose bit is clear.
/// Two full sweeps guarantee a victim if any evictable frame exists.
pub struct ClockReplacer {
    reference_bits: Vec<bool>,
    tracked: Vec<bool>,
    tracked_count: usize,
    clock_hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            reference_bits: vec![false; num_frames],
            tracked: vec![false; num_frames],
            tracked_count: 0,
            clock_hand: 0,
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.tracked.len()
    }
}

impl Replacer for ClockReplacer {
    fn insert(&mut self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx >= self.tracked.len() {
            return;
        }
        if !self.tracked[idx] {
            self.tracked[idx] = true;
            self.tracked_count += 1;
        }
        self.reference_bits[idx] = true;
    }

    fn record_access(&mut self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.reference_bits.len() {
            self.reference_bits[idx] = true;
        }
    }

    fn evict(&mut self, is_evictable: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let num_frames = self.tracked.len();
        if self.tracked_count == 0 || num_frames == 0 {
            return None;
        }

        for _ in 0..(2 * num_frames) {
            let hand = self.clock_hand;
            self.clock_hand = (hand + 1) % num_frames;

            if !self.tracked[hand] {
                continue;
            }
            let frame_id = FrameId(hand as u32);
            if !is_evictable(frame_id) {
                continue;
            }
            if self.reference_bits[hand] {
                self.reference_bits[hand] = false;
                continue;
            }
            self.tracked[hand] = false;
            self.tracked_count -= 1;
            return Some(frame_id);
        }
        None
    }

    fn remove(&mut self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.tracked.len() && self.tracked[idx] {
            self.tracked[idx] = false;
            self.reference_bits[idx] = false;
            self.tracked_count -= 1;
        }
    }

    fn size(&self) -> usize {
        self.tracked_count
    }
}
