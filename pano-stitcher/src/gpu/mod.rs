//! Graphics backends
//!
//! The scheduler drives a [`GraphicsBackend`]: a small verb set over
//! render targets, textures, blend programs, meshes and staging buffers.
//! [`WgpuBackend`] runs on a real adapter; [`SoftwareBackend`] rasterises on
//! the CPU and needs no device.

mod backend;
mod resources;
mod shader;
mod software;
mod wgpu_backend;

pub use backend::{
    BackendFactory, FrameUniforms, GraphicsBackend, GraphicsCapabilities, MeshId, ProgramDesc, ProgramId,
    StagingId, TargetId, TextureFormat, TextureId, Viewport,
};
pub use resources::ResourceTable;
pub use shader::{generate_wgsl, ycbcr_to_rgb};
pub use software::SoftwareBackend;
pub use wgpu_backend::WgpuBackend;
