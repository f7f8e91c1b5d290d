//! Pixel formats accepted from the video source
//!
//! Describes plane geometry for packed, planar and semi-planar layouts so the
//! ring buffer, upload pipeline and shader generator agree on byte layout.

use serde::{Deserialize, Serialize};

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PixelFormat {
    /// Packed tri-channel RGB, 3 bytes per pixel
    #[default]
    Rgb24,
    /// Planar Y′CbCr 4:2:0 (Y, Cb, Cr planes)
    Yuv420p,
    /// Semi-planar Y′CbCr 4:2:0 (Y plane, interleaved CbCr plane)
    Nv12,
}

/// Geometry of a single plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Plane width in samples
    pub width: u32,
    /// Plane height in rows
    pub height: u32,
    /// Bytes per sample
    pub bytes_per_sample: usize,
}

impl PlaneLayout {
    /// Tightly packed row length in bytes
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_sample
    }

    /// Tightly packed plane size in bytes
    pub fn size(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

impl PixelFormat {
    /// Number of planes the video source supplies
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 1,
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
        }
    }

    /// Geometry of plane `plane` for a `width` x `height` frame
    pub fn plane_layout(self, plane: usize, width: u32, height: u32) -> PlaneLayout {
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        match (self, plane) {
            (PixelFormat::Rgb24, _) => PlaneLayout { width, height, bytes_per_sample: 3 },
            (PixelFormat::Yuv420p, 0) | (PixelFormat::Nv12, 0) => {
                PlaneLayout { width, height, bytes_per_sample: 1 }
            }
            (PixelFormat::Yuv420p, _) => PlaneLayout {
                width: chroma_w,
                height: chroma_h,
                bytes_per_sample: 1,
            },
            (PixelFormat::Nv12, _) => PlaneLayout {
                width: chroma_w,
                height: chroma_h,
                bytes_per_sample: 2,
            },
        }
    }

    /// Tightly packed frame size in bytes
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        (0..self.plane_count())
            .map(|p| self.plane_layout(p, width, height).size())
            .sum()
    }

    /// Whether the format carries luma/chroma planes
    pub fn is_ycbcr(self) -> bool {
        !matches!(self, PixelFormat::Rgb24)
    }

    /// Get display name for logs
    pub fn display_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB24 (packed)",
            PixelFormat::Yuv420p => "YUV420P (planar)",
            PixelFormat::Nv12 => "NV12 (semi-planar)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_counts() {
        assert_eq!(PixelFormat::Rgb24.plane_count(), 1);
        assert_eq!(PixelFormat::Nv12.plane_count(), 2);
        assert_eq!(PixelFormat::Yuv420p.plane_count(), 3);
    }

    #[test]
    fn test_odd_dimensions_round_chroma_up() {
        let uv = PixelFormat::Yuv420p.plane_layout(1, 5, 3);
        assert_eq!((uv.width, uv.height), (3, 2));
        // 15 luma + 2 * 6 chroma
        assert_eq!(PixelFormat::Yuv420p.frame_size(5, 3), 27);
        // 15 luma + 3 * 2 * 2 interleaved chroma
        assert_eq!(PixelFormat::Nv12.frame_size(5, 3), 27);
    }

    #[test]
    fn test_packed_size() {
        assert_eq!(PixelFormat::Rgb24.frame_size(1920, 1080), 1920 * 1080 * 3);
    }
}
