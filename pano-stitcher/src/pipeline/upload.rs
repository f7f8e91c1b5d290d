//! Host → GPU frame upload
//!
//! One texture set per camera, re-allocated only when that camera's
//! resolution or format changes. Frames are repacked into a reused staging
//! package (RGB expanded to RGBA, semi-planar chroma split when two-channel
//! textures are unavailable) and written plane by plane.

use std::collections::VecDeque;

use crate::error::GpuError;
use crate::frame::{FrameHeader, PixelFormat};
use crate::gpu::{GraphicsBackend, GraphicsCapabilities, TextureFormat, TextureId};

/// Package sizes remembered when sizing the staging package
const SIZE_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CameraTextureSet {
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// GPU plane layout used to sample frames of `format`
fn texture_planes(format: PixelFormat, width: u32, height: u32, rg8: bool) -> Vec<(u32, u32, TextureFormat)> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    match format {
        PixelFormat::Rgb24 => vec![(width, height, TextureFormat::Rgba8)],
        PixelFormat::Nv12 if rg8 => vec![(width, height, TextureFormat::R8), (cw, ch, TextureFormat::Rg8)],
        PixelFormat::Nv12 | PixelFormat::Yuv420p => vec![
            (width, height, TextureFormat::R8),
            (cw, ch, TextureFormat::R8),
            (cw, ch, TextureFormat::R8),
        ],
    }
}

pub struct TextureUploadPipeline {
    supports_rg8: bool,
    sets: Vec<Option<CameraTextureSet>>,
    textures: Vec<Vec<TextureId>>,
    staging: Vec<u8>,
    recent_sizes: VecDeque<usize>,
    uploads: u64,
    staging_reallocations: u64,
}

impl TextureUploadPipeline {
    pub fn new(camera_count: usize, caps: &GraphicsCapabilities) -> Self {
        Self {
            supports_rg8: caps.supports_rg8,
            sets: vec![None; camera_count],
            textures: vec![Vec::new(); camera_count],
            staging: Vec::new(),
            recent_sizes: VecDeque::with_capacity(SIZE_HISTORY),
            uploads: 0,
            staging_reallocations: 0,
        }
    }

    /// Format the textures are sampled in for a source `format`
    pub fn sampled_format_for(&self, format: PixelFormat) -> PixelFormat {
        match format {
            PixelFormat::Nv12 if !self.supports_rg8 => PixelFormat::Yuv420p,
            other => other,
        }
    }

    /// Upload one compact frame payload for `camera`
    pub fn upload(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        camera: usize,
        header: &FrameHeader,
        data: &[u8],
    ) -> Result<(), GpuError> {
        if camera >= self.sets.len() {
            return Err(GpuError::InvalidHandle {
                kind: "camera",
                id: camera as u32,
            });
        }
        self.ensure_textures(backend, camera, header)?;

        let planes = texture_planes(header.format, header.width, header.height, self.supports_rg8);
        let package: usize = planes
            .iter()
            .map(|&(w, h, f)| w as usize * h as usize * f.bytes_per_pixel())
            .sum();
        self.reserve_staging(package);

        let staging = &mut self.staging[..package];
        match header.format {
            PixelFormat::Rgb24 => {
                let rgb = header.plane(data, 0);
                for (dst, src) in staging.chunks_exact_mut(4).zip(rgb.chunks_exact(3)) {
                    dst[..3].copy_from_slice(src);
                    dst[3] = 255;
                }
            }
            PixelFormat::Nv12 if !self.supports_rg8 => {
                let luma = header.plane(data, 0);
                let chroma = header.plane(data, 1);
                let (y, rest) = staging.split_at_mut(luma.len());
                y.copy_from_slice(luma);
                let (cb, cr) = rest.split_at_mut(chroma.len() / 2);
                for (i, pair) in chroma.chunks_exact(2).enumerate() {
                    cb[i] = pair[0];
                    cr[i] = pair[1];
                }
            }
            PixelFormat::Nv12 | PixelFormat::Yuv420p => {
                staging.copy_from_slice(&data[..package]);
            }
        }

        let textures = &self.textures[camera];
        let mut offset = 0;
        for (&(w, h, f), &texture) in planes.iter().zip(textures) {
            let size = w as usize * h as usize * f.bytes_per_pixel();
            backend.write_texture(texture, &self.staging[offset..offset + size])?;
            offset += size;
        }
        self.uploads += 1;
        Ok(())
    }

    fn ensure_textures(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        camera: usize,
        header: &FrameHeader,
    ) -> Result<(), GpuError> {
        let unchanged = self.sets[camera]
            .as_ref()
            .is_some_and(|s| s.width == header.width && s.height == header.height && s.format == header.format);
        if unchanged {
            return Ok(());
        }

        for texture in self.textures[camera].drain(..) {
            backend.destroy_texture(texture);
        }
        self.sets[camera] = None;

        let mut textures = Vec::with_capacity(3);
        for (w, h, f) in texture_planes(header.format, header.width, header.height, self.supports_rg8) {
            match backend.create_texture(w, h, f) {
                Ok(t) => textures.push(t),
                Err(e) => {
                    for t in textures {
                        backend.destroy_texture(t);
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(
            "Camera {} textures: {}x{} {}",
            camera,
            header.width,
            header.height,
            header.format.display_name()
        );
        self.textures[camera] = textures;
        self.sets[camera] = Some(CameraTextureSet {
            width: header.width,
            height: header.height,
            format: header.format,
        });
        Ok(())
    }

    /// Size the package to the largest of the recent uploads
    fn reserve_staging(&mut self, package: usize) {
        if self.recent_sizes.len() == SIZE_HISTORY {
            self.recent_sizes.pop_front();
        }
        self.recent_sizes.push_back(package);
        let want = self.recent_sizes.iter().copied().max().unwrap_or(package);
        if self.staging.len() < want || self.staging.len() >= want * 2 {
            self.staging = vec![0; want];
            self.staging_reallocations += 1;
        }
    }

    /// Per-camera plane textures, in camera order
    pub fn textures(&self) -> &[Vec<TextureId>] {
        &self.textures
    }

    /// Every camera has uploaded a frame and all share one sampled format
    pub fn all_uploaded(&self) -> bool {
        self.sampled_format().is_some()
    }

    /// Common sampled format once every camera has textures
    pub fn sampled_format(&self) -> Option<PixelFormat> {
        let mut formats = self.sets.iter().map(|s| s.as_ref().map(|s| s.format));
        let first = formats.next()??;
        formats
            .all(|f| f == Some(first))
            .then(|| self.sampled_format_for(first))
    }

    /// Two differing source formats among the cameras that have textures
    pub fn format_conflict(&self) -> Option<(PixelFormat, PixelFormat)> {
        let mut formats = self.sets.iter().flatten().map(|s| s.format);
        let first = formats.next()?;
        formats.find(|&f| f != first).map(|other| (first, other))
    }

    pub fn staging_capacity(&self) -> usize {
        self.staging.len()
    }

    pub fn staging_reallocations(&self) -> u64 {
        self.staging_reallocations
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Destroy every camera texture
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for textures in &mut self.textures {
            for texture in textures.drain(..) {
                backend.destroy_texture(texture);
            }
        }
        self.sets.iter_mut().for_each(|s| *s = None);
        self.staging = Vec::new();
        self.recent_sizes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn header(format: PixelFormat, width: u32, height: u32) -> FrameHeader {
        FrameHeader {
            format,
            width,
            height,
            pts: 0.0,
            sequence: 0,
        }
    }

    #[test]
    fn test_rgb_upload_allocates_once() {
        let mut backend = SoftwareBackend::new();
        let mut pipeline = TextureUploadPipeline::new(2, backend.capabilities());
        assert!(!pipeline.all_uploaded());

        let h = header(PixelFormat::Rgb24, 4, 2);
        let data = vec![10u8; h.byte_size()];
        pipeline.upload(&mut backend, 0, &h, &data).unwrap();
        let first = pipeline.textures()[0].clone();
        pipeline.upload(&mut backend, 0, &h, &data).unwrap();
        assert_eq!(pipeline.textures()[0], first);
        assert!(!pipeline.all_uploaded());

        pipeline.upload(&mut backend, 1, &h, &data).unwrap();
        assert!(pipeline.all_uploaded());
        assert_eq!(pipeline.sampled_format(), Some(PixelFormat::Rgb24));
        assert_eq!(pipeline.staging_capacity(), 4 * 2 * 4);
        assert_eq!(pipeline.uploads(), 3);
    }

    #[test]
    fn test_mixed_formats_block_sampling() {
        let mut backend = SoftwareBackend::new();
        let mut pipeline = TextureUploadPipeline::new(2, backend.capabilities());
        let rgb = header(PixelFormat::Rgb24, 4, 2);
        let yuv = header(PixelFormat::Yuv420p, 4, 2);
        pipeline.upload(&mut backend, 0, &rgb, &vec![0; rgb.byte_size()]).unwrap();
        assert_eq!(pipeline.format_conflict(), None);

        pipeline.upload(&mut backend, 1, &yuv, &vec![0; yuv.byte_size()]).unwrap();
        assert_eq!(pipeline.format_conflict(), Some((PixelFormat::Rgb24, PixelFormat::Yuv420p)));
        assert_eq!(pipeline.sampled_format(), None);
        assert!(!pipeline.all_uploaded());

        pipeline.upload(&mut backend, 1, &rgb, &vec![0; rgb.byte_size()]).unwrap();
        assert_eq!(pipeline.format_conflict(), None);
        assert_eq!(pipeline.sampled_format(), Some(PixelFormat::Rgb24));
    }

    #[test]
    fn test_resolution_change_reallocates() {
        let mut backend = SoftwareBackend::new();
        let mut pipeline = TextureUploadPipeline::new(1, backend.capabilities());
        let small = header(PixelFormat::Yuv420p, 4, 4);
        pipeline.upload(&mut backend, 0, &small, &vec![0; small.byte_size()]).unwrap();
        let before = pipeline.textures()[0].clone();
        assert_eq!(before.len(), 3);

        let large = header(PixelFormat::Yuv420p, 8, 8);
        pipeline.upload(&mut backend, 0, &large, &vec![0; large.byte_size()]).unwrap();
        assert_ne!(pipeline.textures()[0], before);
        assert!(backend.write_texture(before[0], &[0; 16]).is_err());
    }

    #[test]
    fn test_nv12_without_rg8_splits_chroma() {
        let mut caps = SoftwareBackend::new().capabilities().clone();
        caps.supports_rg8 = false;
        let mut backend = SoftwareBackend::with_capabilities(caps.clone());
        let mut pipeline = TextureUploadPipeline::new(1, &caps);

        let h = header(PixelFormat::Nv12, 2, 2);
        // Y plane then one CbCr pair
        pipeline.upload(&mut backend, 0, &h, &[1, 2, 3, 4, 100, 200]).unwrap();
        assert_eq!(pipeline.textures()[0].len(), 3);
        assert_eq!(pipeline.sampled_format(), Some(PixelFormat::Yuv420p));
        assert_eq!(pipeline.staging_capacity(), 6);
    }

    #[test]
    fn test_staging_tracks_recent_maximum() {
        let mut backend = SoftwareBackend::new();
        let mut pipeline = TextureUploadPipeline::new(1, backend.capabilities());
        let large = header(PixelFormat::Rgb24, 16, 16);
        let small = header(PixelFormat::Rgb24, 4, 4);
        pipeline.upload(&mut backend, 0, &large, &vec![0; large.byte_size()]).unwrap();
        assert_eq!(pipeline.staging_capacity(), 1024);

        for _ in 0..9 {
            pipeline.upload(&mut backend, 0, &small, &vec![0; small.byte_size()]).unwrap();
        }
        // Large upload still within the last ten
        assert_eq!(pipeline.staging_capacity(), 1024);
        pipeline.upload(&mut backend, 0, &small, &vec![0; small.byte_size()]).unwrap();
        assert_eq!(pipeline.staging_capacity(), 64);
    }

    #[test]
    fn test_unknown_camera_rejected() {
        let mut backend = SoftwareBackend::new();
        let mut pipeline = TextureUploadPipeline::new(1, backend.capabilities());
        let h = header(PixelFormat::Rgb24, 2, 2);
        assert!(pipeline.upload(&mut backend, 3, &h, &[0; 12]).is_err());
    }
}
