//! Renderable scene for one (pano type, input resolution) pair
//!
//! `create` does all CPU work (tessellation, projection, patch discovery);
//! `prepare` turns patches into backend programs and meshes for the sampled
//! pixel format; `render` draws every covered patch; `release` frees the
//! backend objects. A scene is replaced wholesale whenever its pano type or
//! input resolution changes.

use crate::error::{GpuError, RecoverableError};
use crate::frame::PixelFormat;
use crate::gpu::{FrameUniforms, GraphicsBackend, GraphicsCapabilities, MeshId, ProgramDesc, ProgramId, TextureId};
use crate::patch::{build_patches, BlendConfig, Patch};
use crate::projection::{create_projectors, CalibrationProfile, PanoType};
use crate::surface::{PanoGeometry, SurfaceKind, SurfaceMesh};

/// Grid resolution (columns, rows) used for each canonical surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tessellation {
    pub sphere: (u32, u32),
    pub cylinder: (u32, u32),
    pub plane: (u32, u32),
}

impl Default for Tessellation {
    fn default() -> Self {
        Self {
            sphere: (128, 64),
            cylinder: (128, 16),
            plane: (64, 32),
        }
    }
}

impl Tessellation {
    pub fn segments(&self, kind: SurfaceKind) -> (u32, u32) {
        match kind {
            SurfaceKind::Sphere => self.sphere,
            SurfaceKind::Cylinder => self.cylinder,
            SurfaceKind::Plane => self.plane,
        }
    }
}

/// Blend settings for a scene build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneConfig {
    pub tessellation: Tessellation,
    pub blend: BlendConfig,
    /// Sharpness used for the circular binocular layout
    pub annulus_exponent: f64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            tessellation: Tessellation::default(),
            blend: BlendConfig::default(),
            annulus_exponent: 5.0,
        }
    }
}

struct PatchResources {
    patch: usize,
    program: ProgramId,
    mesh: MeshId,
}

pub struct RenderScene {
    geometry: PanoGeometry,
    input_width: u32,
    input_height: u32,
    camera_count: usize,
    triangle_count: usize,
    patches: Vec<Patch>,
    resources: Vec<PatchResources>,
    prepared_format: Option<PixelFormat>,
}

impl RenderScene {
    /// Build geometry and patches for `pano_type` at the given input resolution
    pub fn create(
        profile: &CalibrationProfile,
        pano_type: PanoType,
        input_width: u32,
        input_height: u32,
        config: &SceneConfig,
        caps: &GraphicsCapabilities,
    ) -> Result<Self, RecoverableError> {
        let layout = profile
            .layout(pano_type)
            .ok_or_else(|| RecoverableError::UnsupportedPanoType(pano_type.name().to_string()))?;
        let camera_count = profile.camera_count();
        let geometry = PanoGeometry::new(layout, camera_count, input_width, input_height);
        let (columns, rows) = config.tessellation.segments(geometry.surface_kind());
        let mesh = SurfaceMesh::for_pano(&geometry, columns, rows);
        let projectors = create_projectors(profile, layout, input_width, input_height)?;

        let mut blend = config.blend;
        blend.max_cameras_per_patch = blend.max_cameras_per_patch.min(caps.max_cameras_per_program).max(1);
        if pano_type == PanoType::Binocular {
            blend.exponent = config.annulus_exponent;
        }
        let patches = build_patches(&mesh, &projectors, &blend);

        tracing::info!(
            "Scene {} {}x{}: {} triangles in {} patches ({} covered)",
            pano_type,
            input_width,
            input_height,
            mesh.triangle_count(),
            patches.len(),
            patches.iter().filter(|p| p.is_renderable()).count()
        );

        Ok(Self {
            geometry,
            input_width,
            input_height,
            camera_count,
            triangle_count: mesh.triangle_count(),
            patches,
            resources: Vec::new(),
            prepared_format: None,
        })
    }

    /// Compile one program and upload one mesh per covered patch.
    ///
    /// `format` is the layout the camera textures are sampled in. Calling
    /// again with the same format is a no-op.
    pub fn prepare(&mut self, backend: &mut dyn GraphicsBackend, format: PixelFormat) -> Result<(), GpuError> {
        if self.prepared_format == Some(format) {
            return Ok(());
        }
        self.release(backend);

        for (index, patch) in self.patches.iter().enumerate() {
            if !patch.is_renderable() {
                continue;
            }
            let desc = ProgramDesc {
                camera_count: patch.cameras.len(),
                pixel_format: format,
            };
            let program = backend.compile_program(&desc)?;
            let mesh = match backend.create_mesh(
                &patch.interleaved(),
                Patch::stride_floats(patch.cameras.len()),
                &patch.indices,
            ) {
                Ok(mesh) => mesh,
                Err(e) => {
                    backend.destroy_program(program);
                    return Err(e);
                }
            };
            self.resources.push(PatchResources {
                patch: index,
                program,
                mesh,
            });
        }

        tracing::debug!(
            "Prepared {} patch programs for {}",
            self.resources.len(),
            format.display_name()
        );
        self.prepared_format = Some(format);
        Ok(())
    }

    /// Draw every covered patch into the bound target.
    ///
    /// `camera_textures[i]` holds camera `i`'s planes in order.
    pub fn render(
        &self,
        backend: &mut dyn GraphicsBackend,
        camera_textures: &[Vec<TextureId>],
        uniforms: &FrameUniforms,
    ) -> Result<(), GpuError> {
        let mut bound = Vec::new();
        for res in &self.resources {
            let patch = &self.patches[res.patch];
            bound.clear();
            for &camera in &patch.cameras {
                let planes = camera_textures.get(camera).ok_or(GpuError::InvalidHandle {
                    kind: "camera texture set",
                    id: camera as u32,
                })?;
                bound.extend_from_slice(planes);
            }
            backend.draw(res.program, res.mesh, &bound, uniforms)?;
        }
        Ok(())
    }

    /// Free all backend objects; the CPU-side patches stay
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for res in self.resources.drain(..) {
            backend.destroy_program(res.program);
            backend.destroy_mesh(res.mesh);
        }
        self.prepared_format = None;
    }

    pub fn geometry(&self) -> &PanoGeometry {
        &self.geometry
    }

    pub fn pano_type(&self) -> PanoType {
        self.geometry.pano_type()
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    pub fn camera_count(&self) -> usize {
        self.camera_count
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Patches that are actually drawn
    pub fn patch_count(&self) -> usize {
        self.patches.iter().filter(|p| p.is_renderable()).count()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared_format.is_some()
    }

    /// Full panorama size at native resolution, limited by the device
    pub fn native_size(&self, caps: &GraphicsCapabilities) -> (u32, u32) {
        self.geometry.native_size(caps.max_texture_dimension)
    }
}
