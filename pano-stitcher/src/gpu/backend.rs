//! Graphics verb set driven by the render scheduler
//!
//! All calls happen on the scheduler thread. Handles are plain ids into
//! backend-owned tables; using a destroyed handle is an error, not UB.

use glam::Mat4;

use crate::error::GpuError;
use crate::frame::PixelFormat;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn id(self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// Offscreen colour + depth target
    TargetId
);
handle!(
    /// Sampleable texture
    TextureId
);
handle!(
    /// Compiled blend program
    ProgramId
);
handle!(
    /// Uploaded vertex + index data
    MeshId
);
handle!(
    /// Host-visible readback buffer
    StagingId
);

/// Device limits gathered once when the context is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsCapabilities {
    /// Human-readable backend/adapter name
    pub backend: String,
    /// Largest texture or render target side
    pub max_texture_dimension: u32,
    /// Two-channel textures available (semi-planar chroma)
    pub supports_rg8: bool,
    /// Most cameras one program can blend
    pub max_cameras_per_program: usize,
}

/// Texel layout of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rg8,
    Rgba8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
            TextureFormat::Rgba8 => 4,
        }
    }
}

/// What a blend program is specialised for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramDesc {
    pub camera_count: usize,
    /// Sampled layout; `Rgb24` frames are sampled from expanded RGBA textures
    pub pixel_format: PixelFormat,
}

impl ProgramDesc {
    /// Textures bound per camera
    pub fn planes_per_camera(&self) -> usize {
        self.pixel_format.plane_count()
    }

    /// Total textures a draw with this program binds
    pub fn texture_count(&self) -> usize {
        self.camera_count * self.planes_per_camera()
    }
}

/// Per-draw uniforms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameUniforms {
    pub view_proj: Mat4,
    /// Place vertices at their panorama coordinate instead of their 3D position
    pub unwrap: bool,
}

impl FrameUniforms {
    pub fn view(view_proj: Mat4) -> Self {
        Self {
            view_proj,
            unwrap: false,
        }
    }

    pub fn unwrapped() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            unwrap: true,
        }
    }
}

/// Pixel rectangle of the bound target; origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

/// Minimal graphics API the scheduler drives
pub trait GraphicsBackend: Send {
    fn capabilities(&self) -> &GraphicsCapabilities;

    /// RGBA8 colour target with a depth buffer
    fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError>;
    fn resize_render_target(&mut self, target: TargetId, width: u32, height: u32) -> Result<(), GpuError>;
    fn destroy_render_target(&mut self, target: TargetId);
    /// `None` binds the display back buffer
    fn bind_render_target(&mut self, target: Option<TargetId>) -> Result<(), GpuError>;
    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError>;
    /// Clear colour and depth of the whole bound target
    fn clear(&mut self, color: [f32; 4]) -> Result<(), GpuError>;

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError>;
    /// Replace all texels; `data` is tightly packed
    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, GpuError>;
    fn destroy_program(&mut self, program: ProgramId);

    /// Interleaved vertex data with `stride_floats` floats per vertex
    fn create_mesh(&mut self, vertices: &[f32], stride_floats: usize, indices: &[u32]) -> Result<MeshId, GpuError>;
    fn destroy_mesh(&mut self, mesh: MeshId);

    /// Draw into the bound target. `textures` holds each camera's planes in order.
    fn draw(
        &mut self,
        program: ProgramId,
        mesh: MeshId,
        textures: &[TextureId],
        uniforms: &FrameUniforms,
    ) -> Result<(), GpuError>;

    fn create_staging_buffer(&mut self, size: usize) -> Result<StagingId, GpuError>;
    fn resize_staging_buffer(&mut self, staging: StagingId, size: usize) -> Result<(), GpuError>;
    fn destroy_staging_buffer(&mut self, staging: StagingId);
    /// Start an asynchronous copy of a target's colour into a staging buffer
    fn read_render_target(&mut self, target: TargetId, staging: StagingId) -> Result<(), GpuError>;
    /// Non-blocking: copies tightly packed RGBA into `out` and returns true
    /// once the copy has landed, false while it is still in flight
    fn map_staging(&mut self, staging: StagingId, out: &mut Vec<u8>) -> Result<bool, GpuError>;

    /// Swap the display buffers
    fn present(&mut self) -> Result<(), GpuError>;
    fn resize_display(&mut self, width: u32, height: u32) -> Result<(), GpuError>;
}

/// Builds a backend on the scheduler thread
pub type BackendFactory = Box<dyn FnOnce() -> Result<Box<dyn GraphicsBackend>, GpuError> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_texture_counts() {
        let desc = ProgramDesc {
            camera_count: 3,
            pixel_format: PixelFormat::Yuv420p,
        };
        assert_eq!(desc.texture_count(), 9);
        let desc = ProgramDesc {
            camera_count: 2,
            pixel_format: PixelFormat::Rgb24,
        };
        assert_eq!(desc.texture_count(), 2);
    }

    #[test]
    fn test_backend_moves_to_render_thread() {
        fn assert_send<T: Send>() {}
        assert_send::<Box<dyn GraphicsBackend>>();
        assert_send::<BackendFactory>();

        let backend: Box<dyn GraphicsBackend> = Box::new(crate::gpu::SoftwareBackend::new());
        let name = std::thread::spawn(move || backend.capabilities().backend.clone())
            .join()
            .unwrap();
        assert!(!name.is_empty());
    }
}
