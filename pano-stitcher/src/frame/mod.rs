//! Decoded frame representation and per-camera frame queues
//!
//! Frames arrive from the video source as borrowed plane slices
//! ([`FrameView`]), are copied exactly once into a camera's
//! [`FrameRingBuffer`], and are read back on the render thread through the
//! compact [`FrameHeader`] descriptor.

mod format;
mod ring_buffer;

pub use format::{PixelFormat, PlaneLayout};
pub use ring_buffer::{FrameRingBuffer, OverflowPolicy, RingBufferConfig, RingBufferStats};

use crate::error::RecoverableError;

/// A decoded frame borrowed from the video source.
///
/// Plane slices may carry row padding; `strides` gives the byte distance
/// between consecutive rows of each plane.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: [&'a [u8]; 3],
    pub strides: [usize; 3],
    /// Presentation timestamp in seconds
    pub pts: f64,
}

impl<'a> FrameView<'a> {
    /// Wrap a tightly packed buffer holding all planes back to back
    pub fn packed(format: PixelFormat, width: u32, height: u32, data: &'a [u8]) -> Self {
        let mut planes: [&'a [u8]; 3] = [&[], &[], &[]];
        let mut strides = [0usize; 3];
        let mut offset = 0;
        for plane in 0..format.plane_count() {
            let layout = format.plane_layout(plane, width, height);
            let end = (offset + layout.size()).min(data.len());
            planes[plane] = &data[offset.min(end)..end];
            strides[plane] = layout.row_bytes();
            offset += layout.size();
        }
        Self {
            format,
            width,
            height,
            planes,
            strides,
            pts: 0.0,
        }
    }

    /// Set the presentation timestamp
    pub fn with_pts(mut self, pts: f64) -> Self {
        self.pts = pts;
        self
    }

    /// Check that every plane holds enough rows for the declared geometry
    pub fn validate(&self) -> Result<(), RecoverableError> {
        if self.width == 0 || self.height == 0 {
            return Err(RecoverableError::InvalidFrame(format!(
                "zero-sized frame {}x{}",
                self.width, self.height
            )));
        }
        for plane in 0..self.format.plane_count() {
            let layout = self.format.plane_layout(plane, self.width, self.height);
            let stride = self.strides[plane];
            if stride < layout.row_bytes() {
                return Err(RecoverableError::InvalidFrame(format!(
                    "plane {} stride {} shorter than row of {} bytes",
                    plane,
                    stride,
                    layout.row_bytes()
                )));
            }
            let needed = stride * (layout.height as usize - 1) + layout.row_bytes();
            if self.planes[plane].len() < needed {
                return Err(RecoverableError::InvalidFrame(format!(
                    "plane {} holds {} bytes, needs {}",
                    plane,
                    self.planes[plane].len(),
                    needed
                )));
            }
        }
        Ok(())
    }

    /// Compact descriptor for this frame
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            format: self.format,
            width: self.width,
            height: self.height,
            pts: self.pts,
            sequence: 0,
        }
    }

    /// Copy all planes into `dst` tightly packed, dropping row padding.
    ///
    /// `dst` must be at least `header().byte_size()` long.
    pub fn copy_compact_into(&self, dst: &mut [u8]) {
        let mut offset = 0;
        for plane in 0..self.format.plane_count() {
            let layout = self.format.plane_layout(plane, self.width, self.height);
            let row = layout.row_bytes();
            let src = self.planes[plane];
            for y in 0..layout.height as usize {
                let s = y * self.strides[plane];
                dst[offset..offset + row].copy_from_slice(&src[s..s + row]);
                offset += row;
            }
        }
    }
}

/// Owned, compact description of a frame stored in a ring buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pts: f64,
    /// Submission order within the owning ring buffer
    pub sequence: u64,
}

impl FrameHeader {
    /// Tightly packed frame size in bytes
    pub fn byte_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Slice plane `plane` out of a compact frame payload
    pub fn plane<'b>(&self, data: &'b [u8], plane: usize) -> &'b [u8] {
        let mut offset = 0;
        for p in 0..plane {
            offset += self.format.plane_layout(p, self.width, self.height).size();
        }
        let size = self.format.plane_layout(plane, self.width, self.height).size();
        &data[offset..offset + size]
    }
}
