//! Per-camera frame ring buffer
//!
//! A contiguous byte arena holding variable-size frames plus a FIFO index of
//! `{offset, header}` entries. One producer thread writes and the render
//! thread reads; neither allocates per frame.
//!
//! # Protocol
//!
//! Writer: [`create_frame`](FrameRingBuffer::create_frame) →
//! [`in_map_frame`](FrameRingBuffer::in_map_frame) →
//! [`complete_frame`](FrameRingBuffer::complete_frame).
//!
//! Reader: [`grab_frame`](FrameRingBuffer::grab_frame) →
//! [`out_map_frame`](FrameRingBuffer::out_map_frame) → either
//! [`reserve_frame`](FrameRingBuffer::reserve_frame) (keep the entry) or
//! [`release_frame`](FrameRingBuffer::release_frame) (consume it).
//!
//! A grabbed entry is pinned: growth and eviction need to move or drop the
//! oldest entry, so the writer posts its intent and blocks on the
//! `reader_released` condition until the reader lets go. While the intent is
//! posted, `grab_frame` reports "not ready".

use std::collections::VecDeque;
use std::ops::Range;

use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::{FrameHeader, FrameView};
use crate::error::RecoverableError;

/// What to do when a new frame does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OverflowPolicy {
    /// Refuse the new frame
    Reject,
    /// Evict the oldest frame until the new one fits
    #[default]
    Overwrite,
}

/// Ring buffer sizing and overflow behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferConfig {
    /// Number of frames of the newest size the arena is grown to hold
    pub frames: usize,
    /// Overflow behaviour
    pub policy: OverflowPolicy,
    /// Hard arena limit in bytes
    pub max_bytes: usize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            frames: 3,
            policy: OverflowPolicy::Overwrite,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Ring buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingBufferStats {
    /// Frames completed by the writer
    pub accepted: u64,
    /// Frames refused (full or too large)
    pub rejected: u64,
    /// Unread frames dropped to make room
    pub evicted: u64,
    /// Arena reallocations
    pub resized: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    len: usize,
    header: FrameHeader,
}

impl Entry {
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

struct RingState {
    arena: Vec<u8>,
    entries: VecDeque<Entry>,
    /// Region handed out by `create_frame`, not yet completed
    writing: Option<Entry>,
    /// Reader holds the front entry
    reading: bool,
    /// Writer is waiting to resize or evict
    structural_change_pending: bool,
    next_sequence: u64,
    stats: RingBufferStats,
}

impl RingState {
    /// Find the start of a free region of `size` bytes.
    ///
    /// Live entries occupy `[tail, head)`, possibly wrapped once around the
    /// arena end. Tries after the newest frame first, then the arena start.
    fn find_region(&self, size: usize) -> Option<usize> {
        let capacity = self.arena.len();
        if size > capacity {
            return None;
        }
        let (first, last) = match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Some(0),
        };
        let head = last.offset + last.len;
        let tail = first.offset;
        if last.offset >= first.offset {
            if capacity - head >= size {
                Some(head)
            } else if tail >= size {
                Some(0)
            } else {
                None
            }
        } else if tail - head >= size {
            Some(head)
        } else {
            None
        }
    }

    /// Reallocate to `new_len` bytes, compacting live entries from byte 0.
    ///
    /// Only ever called with a larger size. After a resolution drop the
    /// arena keeps its capacity: the smaller frames fit as they are, and a
    /// source that switches back never reallocates again.
    fn grow(&mut self, new_len: usize) {
        let mut arena = vec![0u8; new_len];
        let mut cursor = 0;
        for entry in self.entries.iter_mut() {
            arena[cursor..cursor + entry.len].copy_from_slice(&self.arena[entry.range()]);
            entry.offset = cursor;
            cursor += entry.len;
        }
        tracing::debug!(
            "Ring buffer resized {} -> {} bytes ({} live frames)",
            self.arena.len(),
            new_len,
            self.entries.len()
        );
        self.arena = arena;
        self.stats.resized += 1;
    }
}

/// Lock-bounded ring buffer handing frames from a producer to the renderer
pub struct FrameRingBuffer {
    state: Mutex<RingState>,
    reader_released: Condvar,
    config: RingBufferConfig,
}

impl FrameRingBuffer {
    /// Create an empty ring buffer; the arena is sized by the first frame
    pub fn new(config: RingBufferConfig) -> Self {
        Self {
            state: Mutex::new(RingState {
                arena: Vec::new(),
                entries: VecDeque::with_capacity(config.frames.max(1) + 1),
                writing: None,
                reading: false,
                structural_change_pending: false,
                next_sequence: 0,
                stats: RingBufferStats::default(),
            }),
            reader_released: Condvar::new(),
            config,
        }
    }

    /// Block until the reader lets go of the front entry
    fn wait_for_reader(&self, state: &mut MutexGuard<'_, RingState>) {
        if !state.reading {
            return;
        }
        state.structural_change_pending = true;
        while state.reading {
            self.reader_released.wait(state);
        }
        state.structural_change_pending = false;
    }

    /// Reserve space for a frame described by `header`.
    ///
    /// Grows the arena when `frames` frames of this size no longer fit, then
    /// allocates from the ring. On overflow either fails or evicts the oldest
    /// entries per the configured policy. An uncompleted previous reservation
    /// is abandoned.
    pub fn create_frame(&self, header: FrameHeader) -> Result<(), RecoverableError> {
        let size = header.byte_size();
        if size == 0 {
            return Err(RecoverableError::InvalidFrame("empty frame".into()));
        }

        let mut state = self.state.lock();
        state.writing = None;

        if size > self.config.max_bytes {
            state.stats.rejected += 1;
            return Err(RecoverableError::FrameTooLarge {
                size,
                limit: self.config.max_bytes,
            });
        }

        let wanted = size
            .saturating_mul(self.config.frames.max(1))
            .min(self.config.max_bytes);
        if wanted > state.arena.len() {
            self.wait_for_reader(&mut state);
            state.grow(wanted);
        }

        loop {
            if let Some(offset) = state.find_region(size) {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state.writing = Some(Entry {
                    offset,
                    len: size,
                    header: FrameHeader { sequence, ..header },
                });
                return Ok(());
            }

            match self.config.policy {
                OverflowPolicy::Reject => {
                    state.stats.rejected += 1;
                    return Err(RecoverableError::RingBufferFull { needed: size });
                }
                OverflowPolicy::Overwrite => {
                    if state.entries.is_empty() {
                        state.stats.rejected += 1;
                        return Err(RecoverableError::FrameTooLarge {
                            size,
                            limit: state.arena.len(),
                        });
                    }
                    if state.reading {
                        // The reader may consume the front entry meanwhile; re-check
                        self.wait_for_reader(&mut state);
                        continue;
                    }
                    state.entries.pop_front();
                    state.stats.evicted += 1;
                }
            }
        }
    }

    /// Writable region of the frame reserved by `create_frame`.
    ///
    /// The arena lock is held until the returned guard is dropped.
    pub fn in_map_frame(&self) -> Option<MappedMutexGuard<'_, [u8]>> {
        let state = self.state.lock();
        let range = state.writing.as_ref()?.range();
        Some(MutexGuard::map(state, |s| &mut s.arena[range]))
    }

    /// Publish the reserved frame to the reader. Returns false if nothing was reserved.
    pub fn complete_frame(&self) -> bool {
        let mut state = self.state.lock();
        match state.writing.take() {
            Some(entry) => {
                state.entries.push_back(entry);
                state.stats.accepted += 1;
                true
            }
            None => false,
        }
    }

    /// Copy a whole frame in: `create_frame`, strided copy, `complete_frame`
    pub fn push_frame(&self, frame: &FrameView<'_>) -> Result<(), RecoverableError> {
        frame.validate()?;
        self.create_frame(frame.header())?;
        {
            let mut region = self
                .in_map_frame()
                .ok_or_else(|| RecoverableError::InvalidFrame("reservation lost".into()))?;
            frame.copy_compact_into(&mut region);
        }
        self.complete_frame();
        Ok(())
    }

    /// Pin the oldest unread frame and return its header, or `None` when
    /// nothing is ready. Grabbing twice returns the same frame.
    pub fn grab_frame(&self) -> Option<FrameHeader> {
        let mut state = self.state.lock();
        if state.reading {
            return state.entries.front().map(|e| e.header);
        }
        if state.structural_change_pending {
            return None;
        }
        let header = state.entries.front()?.header;
        state.reading = true;
        Some(header)
    }

    /// Readable payload of the grabbed frame
    pub fn out_map_frame(&self) -> Option<MappedMutexGuard<'_, [u8]>> {
        let state = self.state.lock();
        if !state.reading {
            return None;
        }
        let range = state.entries.front()?.range();
        Some(MutexGuard::map(state, |s| &mut s.arena[range]))
    }

    /// Unpin the grabbed frame without consuming it
    pub fn reserve_frame(&self) {
        let mut state = self.state.lock();
        if state.reading {
            state.reading = false;
            self.reader_released.notify_all();
        }
    }

    /// Consume and unpin the grabbed frame
    pub fn release_frame(&self) {
        let mut state = self.state.lock();
        if state.reading {
            state.entries.pop_front();
            state.reading = false;
            self.reader_released.notify_all();
        }
    }

    /// Number of unread frames
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no frame is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current arena size in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.state.lock().arena.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> RingBufferStats {
        self.state.lock().stats
    }

    /// Configured behaviour
    pub fn config(&self) -> &RingBufferConfig {
        &self.config
    }

    /// Byte ranges of live entries plus any in-progress reservation
    pub fn live_ranges(&self) -> Vec<Range<usize>> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .chain(state.writing.iter())
            .map(Entry::range)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn rgb_header(width: u32, height: u32) -> FrameHeader {
        FrameHeader {
            format: PixelFormat::Rgb24,
            width,
            height,
            pts: 0.0,
            sequence: 0,
        }
    }

    fn push_filled(ring: &FrameRingBuffer, width: u32, height: u32, fill: u8) -> Result<(), RecoverableError> {
        let data = vec![fill; PixelFormat::Rgb24.frame_size(width, height)];
        ring.push_frame(&FrameView::packed(PixelFormat::Rgb24, width, height, &data))
    }

    fn assert_disjoint(ring: &FrameRingBuffer) {
        let mut ranges = ring.live_ranges();
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start, "overlap: {:?} {:?}", pair[0], pair[1]);
        }
        let capacity = ring.capacity_bytes();
        assert!(ranges.iter().all(|r| r.end <= capacity));
    }

    fn pop(ring: &FrameRingBuffer) -> Option<(FrameHeader, Vec<u8>)> {
        let header = ring.grab_frame()?;
        let data = ring.out_map_frame().map(|d| d.to_vec())?;
        ring.release_frame();
        Some((header, data))
    }

    #[test]
    fn test_grab_empty_is_not_ready() {
        let ring = FrameRingBuffer::new(RingBufferConfig::default());
        assert!(ring.grab_frame().is_none());
        assert!(ring.out_map_frame().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_fifo_order_with_interleaved_reads() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 3,
            policy: OverflowPolicy::Reject,
            max_bytes: 1 << 20,
        });
        let mut rng = StdRng::seed_from_u64(7);
        let mut expected = VecDeque::new();
        let mut fill: u8 = 0;

        for _ in 0..500 {
            if rng.random_bool(0.55) {
                let w = rng.random_range(1..8);
                let h = rng.random_range(1..8);
                fill = fill.wrapping_add(1);
                if push_filled(&ring, w, h, fill).is_ok() {
                    expected.push_back((fill, PixelFormat::Rgb24.frame_size(w, h)));
                }
            } else if let Some((header, data)) = pop(&ring) {
                let (want_fill, want_len) = expected.pop_front().expect("reader saw an extra frame");
                assert_eq!(data.len(), want_len);
                assert_eq!(header.byte_size(), want_len);
                assert!(data.iter().all(|&b| b == want_fill));
            } else {
                assert!(expected.is_empty());
            }
            assert_disjoint(&ring);
        }

        let mut last_sequence = None;
        while let Some((header, data)) = pop(&ring) {
            let (want_fill, _) = expected.pop_front().expect("reader saw an extra frame");
            assert!(data.iter().all(|&b| b == want_fill));
            if let Some(prev) = last_sequence {
                assert!(header.sequence > prev);
            }
            last_sequence = Some(header.sequence);
        }
        assert!(expected.is_empty());
    }

    #[test]
    fn test_reject_when_full() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 2,
            policy: OverflowPolicy::Reject,
            max_bytes: 1 << 20,
        });
        assert!(push_filled(&ring, 4, 4, 1).is_ok());
        assert!(push_filled(&ring, 4, 4, 2).is_ok());
        assert_eq!(
            push_filled(&ring, 4, 4, 3),
            Err(RecoverableError::RingBufferFull { needed: 48 })
        );
        assert_eq!(ring.stats().rejected, 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_overwrite_evicts_oldest() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 2,
            policy: OverflowPolicy::Overwrite,
            max_bytes: 1 << 20,
        });
        for fill in 1..=3 {
            push_filled(&ring, 4, 4, fill).unwrap();
        }
        assert_eq!(ring.stats().evicted, 1);
        let (header, data) = pop(&ring).unwrap();
        assert_eq!(header.sequence, 1);
        assert!(data.iter().all(|&b| b == 2));
        let (_, data) = pop(&ring).unwrap();
        assert!(data.iter().all(|&b| b == 3));
        assert!(pop(&ring).is_none());
    }

    #[test]
    fn test_growth_preserves_unread_frames() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 3,
            policy: OverflowPolicy::Reject,
            max_bytes: 1 << 20,
        });
        push_filled(&ring, 2, 2, 10).unwrap();
        push_filled(&ring, 2, 2, 11).unwrap();
        let before = ring.capacity_bytes();

        // Bigger frame forces a reallocation
        push_filled(&ring, 8, 8, 12).unwrap();
        assert!(ring.capacity_bytes() > before);
        assert_eq!(ring.stats().resized, 2);
        assert_disjoint(&ring);

        let fills: Vec<u8> = std::iter::from_fn(|| pop(&ring)).map(|(_, d)| d[0]).collect();
        assert_eq!(fills, vec![10, 11, 12]);
    }

    #[test]
    fn test_smaller_frames_keep_capacity() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 2,
            policy: OverflowPolicy::Overwrite,
            max_bytes: 1 << 20,
        });
        push_filled(&ring, 8, 8, 1).unwrap();
        let capacity = ring.capacity_bytes();
        let resized = ring.stats().resized;

        for fill in 2..10 {
            push_filled(&ring, 2, 2, fill).unwrap();
            assert_disjoint(&ring);
        }
        assert_eq!(ring.capacity_bytes(), capacity);
        assert_eq!(ring.stats().resized, resized);
        let sizes: Vec<usize> = std::iter::from_fn(|| pop(&ring)).map(|(_, d)| d.len()).collect();
        assert_eq!(sizes.last(), Some(&PixelFormat::Rgb24.frame_size(2, 2)));
    }

    #[test]
    fn test_frame_too_large_fails_permanently() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 3,
            policy: OverflowPolicy::Overwrite,
            max_bytes: 100,
        });
        assert!(matches!(
            push_filled(&ring, 10, 10, 1),
            Err(RecoverableError::FrameTooLarge { size: 300, limit: 100 })
        ));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_reserve_keeps_frame() {
        let ring = FrameRingBuffer::new(RingBufferConfig::default());
        push_filled(&ring, 2, 2, 5).unwrap();
        let first = ring.grab_frame().unwrap();
        ring.reserve_frame();
        let again = ring.grab_frame().unwrap();
        assert_eq!(first.sequence, again.sequence);
        ring.release_frame();
        assert!(ring.grab_frame().is_none());
    }

    #[test]
    fn test_wrap_around_reuses_arena_start() {
        let ring = FrameRingBuffer::new(RingBufferConfig {
            frames: 3,
            policy: OverflowPolicy::Reject,
            max_bytes: 1 << 20,
        });
        for fill in 0..3 {
            push_filled(&ring, 2, 2, fill).unwrap();
        }
        pop(&ring).unwrap();
        push_filled(&ring, 2, 2, 3).unwrap();
        let ranges = ring.live_ranges();
        assert_eq!(ranges.last().unwrap().start, 0);
        assert_disjoint(&ring);
    }

    #[test]
    fn test_writer_waits_for_reader_before_growth() {
        let ring = Arc::new(FrameRingBuffer::new(RingBufferConfig {
            frames: 2,
            policy: OverflowPolicy::Overwrite,
            max_bytes: 1 << 20,
        }));
        push_filled(&ring, 2, 2, 1).unwrap();
        assert!(ring.grab_frame().is_some());

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let ring = Arc::clone(&ring);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                push_filled(&ring, 16, 16, 2).unwrap();
                done.store(true, Ordering::Release);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::Acquire), "writer resized under an active reader");
        let data = ring.out_map_frame().map(|d| d.to_vec()).unwrap();
        assert!(data.iter().all(|&b| b == 1));
        ring.release_frame();

        writer.join().unwrap();
        assert!(done.load(Ordering::Acquire));
        let (_, data) = pop(&ring).unwrap();
        assert!(data.iter().all(|&b| b == 2));
    }
}
