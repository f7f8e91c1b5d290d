//! CPU implementation of the graphics verb set
//!
//! Perspective-correct triangle rasteriser with a depth buffer and bilinear
//! clamp-to-edge sampling. Used headless and in tests; output matches the
//! generated WGSL programs up to sampling precision.

use glam::Vec4;

use super::backend::{
    FrameUniforms, GraphicsBackend, GraphicsCapabilities, MeshId, ProgramDesc, ProgramId, StagingId,
    TargetId, TextureFormat, TextureId, Viewport,
};
use super::resources::ResourceTable;
use super::shader::ycbcr_to_rgb;
use crate::error::GpuError;
use crate::frame::PixelFormat;
use crate::patch::Patch;

/// Vertices with `w` below this are clipped away
const NEAR_W: f32 = 1e-5;

struct SoftTarget {
    width: u32,
    height: u32,
    color: Vec<u8>,
    depth: Vec<f32>,
}

impl SoftTarget {
    fn new(width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            color: vec![0; pixels * 4],
            depth: vec![1.0; pixels],
        }
    }
}

struct SoftTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
}

impl SoftTexture {
    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let bpp = self.format.bytes_per_pixel();
        let i = (y as usize * self.width as usize + x as usize) * bpp;
        let mut out = [0.0, 0.0, 0.0, 1.0];
        for (c, v) in out.iter_mut().enumerate().take(bpp) {
            *v = f32::from(self.data[i + c]) / 255.0;
        }
        out
    }

    /// Bilinear, clamp-to-edge
    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        let x = (u * self.width as f32 - 0.5).clamp(0.0, (self.width - 1) as f32);
        let y = (v * self.height as f32 - 0.5).clamp(0.0, (self.height - 1) as f32);
        let (x0, y0) = (x.floor() as u32, y.floor() as u32);
        let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
        let (fx, fy) = (x - x0 as f32, y - y0 as f32);
        let (a, b, c, d) = (self.texel(x0, y0), self.texel(x1, y0), self.texel(x0, y1), self.texel(x1, y1));
        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            out[i] = top + (bottom - top) * fy;
        }
        out
    }
}

struct SoftMesh {
    vertices: Vec<f32>,
    stride: usize,
    indices: Vec<u32>,
}

struct SoftStaging {
    capacity: usize,
    data: Vec<u8>,
    /// Polls left before the copy is visible; `None` when nothing was requested
    polls_left: Option<u32>,
}

#[derive(Clone)]
struct ClipVertex {
    clip: Vec4,
    attrs: Vec<f32>,
}

impl ClipVertex {
    fn lerp(&self, other: &ClipVertex, t: f32) -> ClipVertex {
        ClipVertex {
            clip: self.clip + (other.clip - self.clip) * t,
            attrs: self
                .attrs
                .iter()
                .zip(&other.attrs)
                .map(|(a, b)| a + (b - a) * t)
                .collect(),
        }
    }
}

/// Headless CPU graphics backend
pub struct SoftwareBackend {
    caps: GraphicsCapabilities,
    targets: ResourceTable<SoftTarget>,
    textures: ResourceTable<SoftTexture>,
    programs: ResourceTable<ProgramDesc>,
    meshes: ResourceTable<SoftMesh>,
    staging: ResourceTable<SoftStaging>,
    display_back: SoftTarget,
    display_front: SoftTarget,
    bound: Option<TargetId>,
    viewport: Viewport,
    readback_latency: u32,
    frames_presented: u64,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_capabilities(GraphicsCapabilities {
            backend: "software".to_string(),
            max_texture_dimension: 8192,
            supports_rg8: true,
            max_cameras_per_program: 64,
        })
    }

    pub fn with_capabilities(caps: GraphicsCapabilities) -> Self {
        Self {
            caps,
            targets: ResourceTable::new("render target"),
            textures: ResourceTable::new("texture"),
            programs: ResourceTable::new("program"),
            meshes: ResourceTable::new("mesh"),
            staging: ResourceTable::new("staging buffer"),
            display_back: SoftTarget::new(1, 1),
            display_front: SoftTarget::new(1, 1),
            bound: None,
            viewport: Viewport::full(1, 1),
            readback_latency: 0,
            frames_presented: 0,
        }
    }

    /// Make readbacks land only after `polls` unsuccessful `map_staging` calls
    pub fn with_readback_latency(mut self, polls: u32) -> Self {
        self.readback_latency = polls;
        self
    }

    /// Last presented display image, RGBA
    pub fn front_buffer(&self) -> (u32, u32, &[u8]) {
        (self.display_front.width, self.display_front.height, &self.display_front.color)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), GpuError> {
        let limit = self.caps.max_texture_dimension;
        let requested = width.max(height);
        if width == 0 || height == 0 || requested > limit {
            return Err(GpuError::ResourceLimit { requested, limit });
        }
        Ok(())
    }
}

fn sample_camera(format: PixelFormat, planes: &[&SoftTexture], u: f32, v: f32) -> [f32; 3] {
    match format {
        PixelFormat::Rgb24 => {
            let [r, g, b, _] = planes[0].sample(u, v);
            [r, g, b]
        }
        PixelFormat::Nv12 => {
            let y = planes[0].sample(u, v)[0];
            let c = planes[1].sample(u, v);
            ycbcr_to_rgb(y, c[0], c[1])
        }
        PixelFormat::Yuv420p => {
            let y = planes[0].sample(u, v)[0];
            let cb = planes[1].sample(u, v)[0];
            let cr = planes[2].sample(u, v)[0];
            ycbcr_to_rgb(y, cb, cr)
        }
    }
}

/// Sutherland–Hodgman against the `w = NEAR_W` plane
fn clip_near(polygon: &[ClipVertex]) -> Vec<ClipVertex> {
    let mut out = Vec::with_capacity(4);
    for (i, current) in polygon.iter().enumerate() {
        let next = &polygon[(i + 1) % polygon.len()];
        let (dc, dn) = (current.clip.w - NEAR_W, next.clip.w - NEAR_W);
        if dc >= 0.0 {
            out.push(current.clone());
        }
        if (dc >= 0.0) != (dn >= 0.0) {
            out.push(current.lerp(next, dc / (dc - dn)));
        }
    }
    out
}

fn edge(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> f32 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

struct Raster<'a> {
    target: &'a mut SoftTarget,
    viewport: Viewport,
    desc: ProgramDesc,
    textures: Vec<&'a SoftTexture>,
}

impl Raster<'_> {
    fn screen(&self, v: &ClipVertex) -> (f32, f32, f32, f32) {
        let inv_w = 1.0 / v.clip.w;
        let ndc = v.clip.truncate() * inv_w;
        let vp = self.viewport;
        let x = vp.x as f32 + (ndc.x + 1.0) * 0.5 * vp.width as f32;
        let y = vp.y as f32 + (1.0 - ndc.y) * 0.5 * vp.height as f32;
        (x, y, ndc.z, inv_w)
    }

    fn shade(&self, attrs: &[f32]) -> [u8; 4] {
        let planes = self.desc.planes_per_camera();
        let mut color = [0.0f32; 3];
        let mut total = 0.0f32;
        for cam in 0..self.desc.camera_count {
            let (u, v, w) = (attrs[3 * cam], attrs[3 * cam + 1], attrs[3 * cam + 2]);
            total += w;
            if w == 0.0 {
                continue;
            }
            let rgb = sample_camera(
                self.desc.pixel_format,
                &self.textures[cam * planes..(cam + 1) * planes],
                u,
                v,
            );
            for c in 0..3 {
                color[c] += w * rgb[c];
            }
        }
        let q = |x: f32| (x.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(color[0]), q(color[1]), q(color[2]), q(total.min(1.0))]
    }

    fn triangle(&mut self, tri: [&ClipVertex; 3]) {
        let s = tri.map(|v| self.screen(v));
        let p = s.map(|(x, y, _, _)| (x, y));
        let area = edge(p[0], p[1], p[2]);
        if area.abs() < 1e-12 {
            return;
        }

        let vp = self.viewport;
        let x_lo = vp.x as f32;
        let y_lo = vp.y as f32;
        let x_hi = (vp.x + vp.width).min(self.target.width) as f32;
        let y_hi = (vp.y + vp.height).min(self.target.height) as f32;
        let min_x = p.iter().map(|q| q.0).fold(f32::INFINITY, f32::min).floor().max(x_lo);
        let max_x = p.iter().map(|q| q.0).fold(f32::NEG_INFINITY, f32::max).ceil().min(x_hi);
        let min_y = p.iter().map(|q| q.1).fold(f32::INFINITY, f32::min).floor().max(y_lo);
        let max_y = p.iter().map(|q| q.1).fold(f32::NEG_INFINITY, f32::max).ceil().min(y_hi);
        if min_x >= max_x || min_y >= max_y {
            return;
        }

        let attr_len = tri[0].attrs.len();
        let mut attrs = vec![0.0f32; attr_len];
        for py in min_y as u32..max_y as u32 {
            for px in min_x as u32..max_x as u32 {
                let c = (px as f32 + 0.5, py as f32 + 0.5);
                let b0 = edge(p[1], p[2], c) / area;
                let b1 = edge(p[2], p[0], c) / area;
                let b2 = edge(p[0], p[1], c) / area;
                if b0 < 0.0 || b1 < 0.0 || b2 < 0.0 {
                    continue;
                }
                let z = b0 * s[0].2 + b1 * s[1].2 + b2 * s[2].2;
                if !(0.0..=1.0).contains(&z) {
                    continue;
                }
                let idx = py as usize * self.target.width as usize + px as usize;
                if z > self.target.depth[idx] {
                    continue;
                }
                let (p0, p1, p2) = (b0 * s[0].3, b1 * s[1].3, b2 * s[2].3);
                let denom = p0 + p1 + p2;
                for (k, a) in attrs.iter_mut().enumerate() {
                    *a = (p0 * tri[0].attrs[k] + p1 * tri[1].attrs[k] + p2 * tri[2].attrs[k]) / denom;
                }
                let rgba = self.shade(&attrs);
                self.target.depth[idx] = z;
                self.target.color[idx * 4..idx * 4 + 4].copy_from_slice(&rgba);
            }
        }
    }
}

impl GraphicsBackend for SoftwareBackend {
    fn capabilities(&self) -> &GraphicsCapabilities {
        &self.caps
    }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError> {
        self.check_size(width, height)?;
        Ok(TargetId(self.targets.insert(SoftTarget::new(width, height))))
    }

    fn resize_render_target(&mut self, target: TargetId, width: u32, height: u32) -> Result<(), GpuError> {
        self.check_size(width, height)?;
        let t = self.targets.get_mut(target.0)?;
        if t.width != width || t.height != height {
            *t = SoftTarget::new(width, height);
        }
        Ok(())
    }

    fn destroy_render_target(&mut self, target: TargetId) {
        self.targets.remove(target.0);
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
        let target = match self.bound {
            Some(id) => self.targets.get_mut(id.0)?,
            None => &mut self.display_back,
        };
        let rgba = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        for px in target.color.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        target.depth.fill(1.0);
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError> {
        self.check_size(width, height)?;
        let data = vec![0; width as usize * height as usize * format.bytes_per_pixel()];
        Ok(TextureId(self.textures.insert(SoftTexture {
            width,
            height,
            format,
            data,
        })))
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError> {
        let t = self.textures.get_mut(texture.0)?;
        if data.len() != t.data.len() {
            return Err(GpuError::MapFailed(format!(
                "texture upload of {} bytes into {} byte texture",
                data.len(),
                t.data.len()
            )));
        }
        t.data.copy_from_slice(data);
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(texture.0);
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
        Ok(ProgramId(self.programs.insert(*desc)))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(program.0);
    }

    fn create_mesh(&mut self, vertices: &[f32], stride_floats: usize, indices: &[u32]) -> Result<MeshId, GpuError> {
        let vertex_count = vertices.len() / stride_floats.max(1);
        if stride_floats < 5 || vertices.len() % stride_floats != 0 {
            return Err(GpuError::MapFailed(format!("bad vertex stride {stride_floats}")));
        }
        if indices.iter().any(|&i| i as usize >= vertex_count) {
            return Err(GpuError::MapFailed("index out of range".into()));
        }
        Ok(MeshId(self.meshes.insert(SoftMesh {
            vertices: vertices.to_vec(),
            stride: stride_floats,
            indices: indices.to_vec(),
        })))
    }

    fn destroy_mesh(&mut self, mesh: MeshId) {
        self.meshes.remove(mesh.0);
    }

    fn draw(
        &mut self,
        program: ProgramId,
        mesh: MeshId,
        textures: &[TextureId],
        uniforms: &FrameUniforms,
    ) -> Result<(), GpuError> {
        let desc = *self.programs.get(program.0)?;
        let mesh = self.meshes.get(mesh.0)?;
        if mesh.stride != Patch::stride_floats(desc.camera_count) {
            return Err(GpuError::MapFailed(format!(
                "mesh stride {} does not match a {}-camera program",
                mesh.stride, desc.camera_count
            )));
        }
        if textures.len() != desc.texture_count() {
            return Err(GpuError::MapFailed(format!(
                "{} textures bound, program expects {}",
                textures.len(),
                desc.texture_count()
            )));
        }
        let bound = textures
            .iter()
            .map(|t| self.textures.get(t.0))
            .collect::<Result<Vec<_>, _>>()?;

        let vertices: Vec<ClipVertex> = mesh
            .vertices
            .chunks_exact(mesh.stride)
            .map(|v| {
                let clip = if uniforms.unwrap {
                    Vec4::new(v[3] * 2.0 - 1.0, 1.0 - v[4] * 2.0, 0.0, 1.0)
                } else {
                    uniforms.view_proj * Vec4::new(v[0], v[1], v[2], 1.0)
                };
                ClipVertex {
                    clip,
                    attrs: v[5..].to_vec(),
                }
            })
            .collect();

        let target = match self.bound {
            Some(id) => self.targets.get_mut(id.0)?,
            None => &mut self.display_back,
        };
        let mut raster = Raster {
            target,
            viewport: self.viewport,
            desc,
            textures: bound,
        };
        for tri in mesh.indices.chunks_exact(3) {
            let polygon = [
                vertices[tri[0] as usize].clone(),
                vertices[tri[1] as usize].clone(),
                vertices[tri[2] as usize].clone(),
            ];
            let clipped = if polygon.iter().all(|v| v.clip.w >= NEAR_W) {
                polygon.to_vec()
            } else {
                clip_near(&polygon)
            };
            for i in 1..clipped.len().saturating_sub(1) {
                raster.triangle([&clipped[0], &clipped[i], &clipped[i + 1]]);
            }
        }
        Ok(())
    }

    fn create_staging_buffer(&mut self, size: usize) -> Result<StagingId, GpuError> {
        Ok(StagingId(self.staging.insert(SoftStaging {
            capacity: size,
            data: Vec::with_capacity(size),
            polls_left: None,
        })))
    }

    fn resize_staging_buffer(&mut self, staging: StagingId, size: usize) -> Result<(), GpuError> {
        let s = self.staging.get_mut(staging.0)?;
        s.capacity = size;
        s.data = Vec::with_capacity(size);
        s.polls_left = None;
        Ok(())
    }

    fn destroy_staging_buffer(&mut self, staging: StagingId) {
        self.staging.remove(staging.0);
    }

    fn read_render_target(&mut self, target: TargetId, staging: StagingId) -> Result<(), GpuError> {
        let t = self.targets.get(target.0)?;
        let s = self.staging.get_mut(staging.0)?;
        if s.capacity < t.color.len() {
            return Err(GpuError::MapFailed(format!(
                "staging buffer holds {} bytes, target needs {}",
                s.capacity,
                t.color.len()
            )));
        }
        s.data.clear();
        s.data.extend_from_slice(&t.color);
        s.polls_left = Some(self.readback_latency);
        Ok(())
    }

    fn map_staging(&mut self, staging: StagingId, out: &mut Vec<u8>) -> Result<bool, GpuError> {
        let s = self.staging.get_mut(staging.0)?;
        match s.polls_left {
            None => Ok(false),
            Some(0) => {
                out.clear();
                out.extend_from_slice(&s.data);
                s.polls_left = None;
                Ok(true)
            }
            Some(n) => {
                s.polls_left = Some(n - 1);
                Ok(false)
            }
        }
    }

    fn present(&mut self) -> Result<(), GpuError> {
        std::mem::swap(&mut self.display_back, &mut self.display_front);
        self.frames_presented += 1;
        Ok(())
    }

    fn resize_display(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        self.check_size(width, height)?;
        if self.display_back.width != width || self.display_back.height != height {
            self.display_back = SoftTarget::new(width, height);
            self.display_front = SoftTarget::new(width, height);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    fn ortho_full() -> Mat4 {
        Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, -1.0, 1.0)
    }

    fn quad_patch_data(weight_a: f32, weight_b: f32) -> (Vec<f32>, Vec<u32>) {
        // Full-canvas quad in panorama coordinates, two cameras
        let corners = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)];
        let mut v = Vec::new();
        for (u, t) in corners {
            v.extend_from_slice(&[u * 2.0 - 1.0, 1.0 - t * 2.0, 0.0, u, t]);
            v.extend_from_slice(&[u, t, weight_a, u, t, weight_b]);
        }
        (v, vec![0, 2, 1, 1, 2, 3])
    }

    fn solid_rgba(backend: &mut SoftwareBackend, rgba: [u8; 4]) -> TextureId {
        let tex = backend.create_texture(2, 2, TextureFormat::Rgba8).unwrap();
        backend.write_texture(tex, &rgba.repeat(4)).unwrap();
        tex
    }

    fn render(unwrap: bool, wa: f32, wb: f32) -> Vec<u8> {
        let mut backend = SoftwareBackend::new();
        let target = backend.create_render_target(8, 8).unwrap();
        let red = solid_rgba(&mut backend, [255, 0, 0, 255]);
        let blue = solid_rgba(&mut backend, [0, 0, 255, 255]);
        let program = backend
            .compile_program(&ProgramDesc {
                camera_count: 2,
                pixel_format: PixelFormat::Rgb24,
            })
            .unwrap();
        let (v, i) = quad_patch_data(wa, wb);
        let mesh = backend.create_mesh(&v, 11, &i).unwrap();
        backend.bind_render_target(Some(target)).unwrap();
        backend.clear([0.0, 0.0, 0.0, 0.0]).unwrap();
        let uniforms = if unwrap {
            FrameUniforms::unwrapped()
        } else {
            FrameUniforms::view(ortho_full())
        };
        backend.draw(program, mesh, &[red, blue], &uniforms).unwrap();
        let staging = backend.create_staging_buffer(8 * 8 * 4).unwrap();
        backend.read_render_target(target, staging).unwrap();
        let mut out = Vec::new();
        assert!(backend.map_staging(staging, &mut out).unwrap());
        out
    }

    #[test]
    fn test_weighted_blend_fills_target() {
        let out = render(true, 0.25, 0.75);
        assert_eq!(out.len(), 256);
        for px in out.chunks_exact(4) {
            assert_eq!(px, &[64, 0, 191, 255]);
        }
    }

    #[test]
    fn test_view_projection_path_matches_unwrap() {
        assert_eq!(render(false, 1.0, 0.0), render(true, 1.0, 0.0));
    }

    #[test]
    fn test_partial_weight_lowers_alpha() {
        let out = render(true, 0.6, 0.0);
        assert_eq!(&out[..4], &[153, 0, 0, 153]);
    }

    #[test]
    fn test_readback_latency() {
        let mut backend = SoftwareBackend::new().with_readback_latency(2);
        let target = backend.create_render_target(2, 2).unwrap();
        let staging = backend.create_staging_buffer(16).unwrap();
        let mut out = Vec::new();
        assert!(!backend.map_staging(staging, &mut out).unwrap());
        backend.read_render_target(target, staging).unwrap();
        assert!(!backend.map_staging(staging, &mut out).unwrap());
        assert!(!backend.map_staging(staging, &mut out).unwrap());
        assert!(backend.map_staging(staging, &mut out).unwrap());
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn test_near_plane_clipping_keeps_visible_part() {
        let a = ClipVertex { clip: Vec4::new(0.0, 0.0, 0.5, 1.0), attrs: vec![0.0] };
        let b = ClipVertex { clip: Vec4::new(1.0, 0.0, 0.5, 1.0), attrs: vec![1.0] };
        let c = ClipVertex { clip: Vec4::new(0.0, 1.0, 0.5, -1.0), attrs: vec![2.0] };
        let clipped = clip_near(&[a, b, c]);
        assert_eq!(clipped.len(), 4);
        assert!(clipped.iter().all(|v| v.clip.w >= NEAR_W - 1e-6));
    }

    #[test]
    fn test_staging_too_small_fails() {
        let mut backend = SoftwareBackend::new();
        let target = backend.create_render_target(4, 4).unwrap();
        let staging = backend.create_staging_buffer(8).unwrap();
        assert!(matches!(
            backend.read_render_target(target, staging),
            Err(GpuError::MapFailed(_))
        ));
        assert!(matches!(
            backend.create_render_target(0, 4),
            Err(GpuError::ResourceLimit { .. })
        ));
    }
}
