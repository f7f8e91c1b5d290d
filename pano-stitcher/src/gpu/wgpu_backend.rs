//! Headless wgpu implementation of the graphics verb set
//!
//! Every draw records its own encoder and submits immediately so the shared
//! uniform buffer can be rewritten between draws. Readback uses the same
//! Pending → Mapping → Ready staging cycle as the capture path: nothing here
//! blocks except context creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::backend::{
    FrameUniforms, GraphicsBackend, GraphicsCapabilities, MeshId, ProgramDesc, ProgramId, StagingId,
    TargetId, TextureFormat, TextureId, Viewport,
};
use super::resources::ResourceTable;
use super::shader::generate_wgsl;
use crate::error::GpuError;
use crate::frame::PixelFormat;
use crate::patch::Patch;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlendUniforms {
    view_proj: [[f32; 4]; 4],
    unwrap: [f32; 4],
}

struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: TextureFormat,
}

struct GpuProgram {
    pipeline: wgpu::RenderPipeline,
    texture_layout: wgpu::BindGroupLayout,
    desc: ProgramDesc,
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
    stride: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// Free for a new copy
    Available,
    /// Copy submitted, not yet mapped
    Pending,
    /// `map_async` issued, waiting for the callback
    Mapping,
    /// Mapped and readable
    Ready,
}

struct GpuStaging {
    /// Requested size in tightly packed bytes
    capacity: usize,
    buffer: Option<wgpu::Buffer>,
    state: BufferState,
    map_complete: Arc<AtomicBool>,
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
}

impl GpuStaging {
    fn reset(&mut self) {
        if let (BufferState::Ready, Some(buffer)) = (self.state, &self.buffer) {
            buffer.unmap();
        }
        self.state = BufferState::Available;
        self.map_complete.store(false, Ordering::Release);
    }
}

/// wgpu device without a surface; the display is an offscreen pair
pub struct WgpuBackend {
    caps: GraphicsCapabilities,
    device: wgpu::Device,
    queue: wgpu::Queue,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    uniform_layout: wgpu::BindGroupLayout,
    targets: ResourceTable<GpuTarget>,
    textures: ResourceTable<GpuTexture>,
    programs: ResourceTable<GpuProgram>,
    meshes: ResourceTable<GpuMesh>,
    staging: ResourceTable<GpuStaging>,
    display_back: GpuTarget,
    display_front: GpuTarget,
    bound: Option<TargetId>,
    viewport: Viewport,
}

fn create_target(device: &wgpu::Device, width: u32, height: u32, label: &str) -> GpuTarget {
    let size = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: COLOR_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let depth = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Stitch Depth Texture"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    GpuTarget {
        view: texture.create_view(&Default::default()),
        depth_view: depth.create_view(&Default::default()),
        texture,
        width,
        height,
    }
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
    }
}

impl WgpuBackend {
    /// Pick an adapter and create the device; blocks until both exist
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let info = adapter.get_info();
        tracing::info!("Using GPU: {}", info.name);
        tracing::info!("Backend: {:?}", info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Pano Stitcher Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let limits = device.limits();
        let supports_rg8 = adapter
            .get_texture_format_features(wgpu::TextureFormat::Rg8Unorm)
            .allowed_usages
            .contains(wgpu::TextureUsages::TEXTURE_BINDING);
        // Each camera costs one vertex attribute, one inter-stage vec4 and up to three textures
        let max_cameras_per_program = (limits.max_vertex_attributes.saturating_sub(2) as usize)
            .min(limits.max_inter_stage_shader_components as usize / 4)
            .min(limits.max_sampled_textures_per_shader_stage as usize / 3)
            .max(1);
        let caps = GraphicsCapabilities {
            backend: format!("{} ({:?})", info.name, info.backend),
            max_texture_dimension: limits.max_texture_dimension_2d,
            supports_rg8,
            max_cameras_per_program,
        };
        tracing::info!(
            "Stitch limits: {} px textures, {} cameras per program, rg8 {}",
            caps.max_texture_dimension,
            caps.max_cameras_per_program,
            caps.supports_rg8
        );

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Stitch Uniform Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Stitch Uniform Buffer"),
            size: std::mem::size_of::<BlendUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Stitch Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Stitch Uniform Bind Group"),
            layout: &uniform_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        let display_back = create_target(&device, 1, 1, "Display Back Buffer");
        let display_front = create_target(&device, 1, 1, "Display Front Buffer");

        Ok(Self {
            caps,
            device,
            queue,
            uniform_buffer,
            uniform_bind_group,
            uniform_layout,
            targets: ResourceTable::new("render target"),
            textures: ResourceTable::new("texture"),
            programs: ResourceTable::new("program"),
            meshes: ResourceTable::new("mesh"),
            staging: ResourceTable::new("staging buffer"),
            display_back,
            display_front,
            bound: None,
            viewport: Viewport::full(1, 1),
        })
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), GpuError> {
        let limit = self.caps.max_texture_dimension;
        let requested = width.max(height);
        if width == 0 || height == 0 || requested > limit {
            return Err(GpuError::ResourceLimit { requested, limit });
        }
        Ok(())
    }

    fn bound_target(&self) -> Result<&GpuTarget, GpuError> {
        match self.bound {
            Some(id) => self.targets.get(id.0),
            None => Ok(&self.display_back),
        }
    }

    /// Collect validation errors raised while `f` runs
    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }
}

impl GraphicsBackend for WgpuBackend {
    fn capabilities(&self) -> &GraphicsCapabilities {
        &self.caps
    }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError> {
        self.check_size(width, height)?;
        let target = create_target(&self.device, width, height, "Stitch Output Target");
        Ok(TargetId(self.targets.insert(target)))
    }

    fn resize_render_target(&mut self, target: TargetId, width: u32, height: u32) -> Result<(), GpuError> {
        self.check_size(width, height)?;
        let current = self.targets.get(target.0)?;
        if current.width != width || current.height != height {
            let replacement = create_target(&self.device, width, height, "Stitch Output Target");
            *self.targets.get_mut(target.0)? = replacement;
        }
        Ok(())
    }

    fn destroy_render_target(&mut self, target: TargetId) {
        if let Some(t) = self.targets.remove(target.0) {
            t.texture.destroy();
        }
        if self.bound == Some(target) {
            self.bound = None;
        }
    }

    fn bind_render_target(&mut self, target: Option<TargetId>) -> Result<(), GpuError> {
        let (w, h) = match target {
            Some(id) => {
                let t = self.targets.get(id.0)?;
                (t.width, t.height)
            }
            None => (self.display_back.width, self.display_back.height),
        };
        self.bound = target;
        self.viewport = Viewport::full(w, h);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
        self.viewport = viewport;
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) -> Result<(), GpuError> {
        let target = self.bound_target()?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Stitch Clear Encoder"),
        });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Stitch Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(color[0]),
                            g: f64::from(color[1]),
                            b: f64::from(color[2]),
                            a: f64::from(color[3]),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError> {
        self.check_size(width, height)?;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Camera Plane Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&Default::default());
        Ok(TextureId(self.textures.insert(GpuTexture {
            texture,
            view,
            width,
            height,
            format,
        })))
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError> {
        let t = self.textures.get(texture.0)?;
        let row = t.width * t.format.bytes_per_pixel() as u32;
        let expected = row as usize * t.height as usize;
        if data.len() != expected {
            return Err(GpuError::MapFailed(format!(
                "texture upload of {} bytes into {expected} byte texture",
                data.len()
            )));
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &t.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(t.height),
            },
            wgpu::Extent3d {
                width: t.width,
                height: t.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(t) = self.textures.remove(texture.0) {
            t.texture.destroy();
        }
    }

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, GpuError> {
        if desc.camera_count == 0 || desc.camera_count > self.caps.max_cameras_per_program {
            return Err(GpuError::ShaderCompile(format!(
                "{} cameras per program unsupported",
                desc.camera_count
            )));
        }
        if desc.pixel_format == PixelFormat::Nv12 && !self.caps.supports_rg8 {
            return Err(GpuError::ShaderCompile("two-channel textures unavailable".into()));
        }

        let source = generate_wgsl(desc);
        let n = desc.camera_count;
        let texture_entries: Vec<wgpu::BindGroupLayoutEntry> = (0..desc.texture_count() as u32)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        let mut attributes = vec![
            wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32x3,
                offset: 0,
                shader_location: 0,
            },
            wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32x2,
                offset: 12,
                shader_location: 1,
            },
        ];
        attributes.extend((0..n).map(|i| wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x3,
            offset: 20 + 12 * i as u64,
            shader_location: 2 + i as u32,
        }));
        let stride = (Patch::stride_floats(n) * std::mem::size_of::<f32>()) as u64;
        let uniform_layout = &self.uniform_layout;

        let (pipeline, texture_layout) = self
            .scoped(|device| {
                let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("Stitch Blend Shader"),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
                let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Stitch Texture Layout"),
                    entries: &texture_entries,
                });
                let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("Stitch Pipeline Layout"),
                    bind_group_layouts: &[uniform_layout, &texture_layout],
                    push_constant_ranges: &[],
                });
                let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("Stitch Blend Pipeline"),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &shader,
                        entry_point: Some("vs_main"),
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: stride,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &attributes,
                        }],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &shader,
                        entry_point: Some("fs_main"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: COLOR_FORMAT,
                            blend: Some(wgpu::BlendState::REPLACE),
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        strip_index_format: None,
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode: None,
                        unclipped_depth: false,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        conservative: false,
                    },
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: DEPTH_FORMAT,
                        depth_write_enabled: true,
                        depth_compare: wgpu::CompareFunction::LessEqual,
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });
                (pipeline, texture_layout)
            })
            .map_err(GpuError::ShaderCompile)?;

        tracing::debug!("Compiled blend program: {} cameras, {}", n, desc.pixel_format.display_name());
        Ok(ProgramId(self.programs.insert(GpuProgram {
            pipeline,
            texture_layout,
            desc: *desc,
        })))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(program.0);
    }

    fn create_mesh(&mut self, vertices: &[f32], stride_floats: usize, indices: &[u32]) -> Result<MeshId, GpuError> {
        if stride_floats < 5 || vertices.len() % stride_floats != 0 {
            return Err(GpuError::MapFailed(format!("bad vertex stride {stride_floats}")));
        }
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Patch Vertex Buffer"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Patch Index Buffer"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Ok(MeshId(self.meshes.insert(GpuMesh {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            stride: stride_floats,
        })))
    }

    fn destroy_mesh(&mut self, mesh: MeshId) {
        if let Some(m) = self.meshes.remove(mesh.0) {
            m.vertex_buffer.destroy();
            m.index_buffer.destroy();
        }
    }

    fn draw(
        &mut self,
        program: ProgramId,
        mesh: MeshId,
        textures: &[TextureId],
        uniforms: &FrameUniforms,
    ) -> Result<(), GpuError> {
        let program = self.programs.get(program.0)?;
        let mesh = self.meshes.get(mesh.0)?;
        if mesh.stride != Patch::stride_floats(program.desc.camera_count) {
            return Err(GpuError::MapFailed(format!(
                "mesh stride {} does not match a {}-camera program",
                mesh.stride, program.desc.camera_count
            )));
        }
        if textures.len() != program.desc.texture_count() {
            return Err(GpuError::MapFailed(format!(
                "{} textures bound, program expects {}",
                textures.len(),
                program.desc.texture_count()
            )));
        }
        let views = textures
            .iter()
            .map(|t| self.textures.get(t.0).map(|t| &t.view))
            .collect::<Result<Vec<_>, _>>()?;
        let entries: Vec<wgpu::BindGroupEntry> = views
            .iter()
            .enumerate()
            .map(|(i, view)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect();
        let texture_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Stitch Texture Bind Group"),
            layout: &program.texture_layout,
            entries: &entries,
        });

        let data = BlendUniforms {
            view_proj: uniforms.view_proj.to_cols_array_2d(),
            unwrap: [if uniforms.unwrap { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
        };
        self.queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&data));

        let target = self.bound_target()?;
        let vp = self.viewport;
        let x = vp.x.min(target.width);
        let y = vp.y.min(target.height);
        let w = vp.width.min(target.width - x);
        let h = vp.height.min(target.height - y);
        if w == 0 || h == 0 {
            return Ok(());
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Stitch Draw Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Stitch Patch Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(x as f32, y as f32, w as f32, h as f32, 0.0, 1.0);
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &self.uniform_bind_group, &[]);
            pass.set_bind_group(1, &texture_bind_group, &[]);
            pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn create_staging_buffer(&mut self, size: usize) -> Result<StagingId, GpuError> {
        Ok(StagingId(self.staging.insert(GpuStaging {
            capacity: size,
            buffer: None,
            state: BufferState::Available,
            map_complete: Arc::new(AtomicBool::new(false)),
            width: 0,
            height: 0,
            padded_bytes_per_row: 0,
        })))
    }

    fn resize_staging_buffer(&mut self, staging: StagingId, size: usize) -> Result<(), GpuError> {
        let s = self.staging.get_mut(staging.0)?;
        s.reset();
        s.capacity = size;
        if let Some(buffer) = s.buffer.take() {
            buffer.destroy();
        }
        Ok(())
    }

    fn destroy_staging_buffer(&mut self, staging: StagingId) {
        if let Some(mut s) = self.staging.remove(staging.0) {
            s.reset();
            if let Some(buffer) = s.buffer.take() {
                buffer.destroy();
            }
        }
    }

    fn read_render_target(&mut self, target: TargetId, staging: StagingId) -> Result<(), GpuError> {
        let t = self.targets.get(target.0)?;
        let s = self.staging.get_mut(staging.0)?;
        let unpadded = t.width * 4;
        if s.capacity < unpadded as usize * t.height as usize {
            return Err(GpuError::MapFailed(format!(
                "staging buffer holds {} bytes, target needs {}",
                s.capacity,
                unpadded as usize * t.height as usize
            )));
        }
        if s.state != BufferState::Available {
            return Err(GpuError::MapFailed("staging buffer still in flight".into()));
        }

        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;
        let needed = u64::from(padded) * u64::from(t.height);
        if s.buffer.as_ref().map_or(true, |b| b.size() < needed) {
            if let Some(old) = s.buffer.take() {
                old.destroy();
            }
            s.buffer = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Stitch Readback Buffer"),
                size: needed,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            }));
        }
        let Some(buffer) = s.buffer.as_ref() else {
            return Err(GpuError::MapFailed("staging buffer unavailable".into()));
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Stitch Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &t.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(t.height),
                },
            },
            wgpu::Extent3d {
                width: t.width,
                height: t.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        s.width = t.width;
        s.height = t.height;
        s.padded_bytes_per_row = padded;
        s.state = BufferState::Pending;
        Ok(())
    }

    fn map_staging(&mut self, staging: StagingId, out: &mut Vec<u8>) -> Result<bool, GpuError> {
        self.device.poll(wgpu::Maintain::Poll);
        let s = self.staging.get_mut(staging.0)?;
        let Some(buffer) = s.buffer.as_ref() else {
            return Ok(false);
        };

        if s.state == BufferState::Pending {
            let map_complete = s.map_complete.clone();
            buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                if result.is_ok() {
                    map_complete.store(true, Ordering::Release);
                }
            });
            s.state = BufferState::Mapping;
            self.device.poll(wgpu::Maintain::Poll);
        }
        if s.state == BufferState::Mapping && s.map_complete.load(Ordering::Acquire) {
            s.state = BufferState::Ready;
        }
        if s.state != BufferState::Ready {
            return Ok(false);
        }

        let unpadded = (s.width * 4) as usize;
        {
            let data = buffer.slice(..).get_mapped_range();
            out.clear();
            out.reserve(unpadded * s.height as usize);
            for row in 0..s.height as usize {
                let start = row * s.padded_bytes_per_row as usize;
                out.extend_from_slice(&data[start..start + unpadded]);
            }
        }
        s.reset();
        Ok(true)
    }

    fn present(&mut self) -> Result<(), GpuError> {
        std::mem::swap(&mut self.display_back, &mut self.display_front);
        Ok(())
    }

    fn resize_display(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        self.check_size(width, height)?;
        if self.display_back.width != width || self.display_back.height != height {
            self.display_back = create_target(&self.device, width, height, "Display Back Buffer");
            self.display_front = create_target(&self.device, width, height, "Display Front Buffer");
        }
        Ok(())
    }
}
