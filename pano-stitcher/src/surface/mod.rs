//! Reference surfaces for panorama layouts
//!
//! Every layout is drawn on one of three canonical surfaces: the unit
//! sphere, a unit-radius cylinder, or a flat canvas spanning
//! `[-aspect, aspect] x [-1, 1]` in the XY plane.

mod mesh;

pub use mesh::{SurfaceMesh, SurfaceVertex};

use std::f64::consts::{PI, TAU};

use glam::{DVec2, DVec3};

use crate::projection::{PanoLayout, PanoType};

/// Canonical surface a layout is drawn on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Sphere,
    Cylinder,
    Plane,
}

/// Shape and size of a panorama for one layout and input configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PanoGeometry {
    layout: PanoLayout,
    camera_count: usize,
    input_width: u32,
    input_height: u32,
}

impl PanoGeometry {
    pub fn new(layout: &PanoLayout, camera_count: usize, input_width: u32, input_height: u32) -> Self {
        Self {
            layout: layout.clone(),
            camera_count: camera_count.max(1),
            input_width: input_width.max(1),
            input_height: input_height.max(1),
        }
    }

    pub fn layout(&self) -> &PanoLayout {
        &self.layout
    }

    pub fn pano_type(&self) -> PanoType {
        self.layout.pano_type
    }

    pub fn surface_kind(&self) -> SurfaceKind {
        surface_kind(self.layout.pano_type)
    }

    /// Panorama width over height
    pub fn aspect(&self) -> f64 {
        let l = &self.layout;
        match l.pano_type {
            PanoType::Sphere360 | PanoType::Sphere360Flipped | PanoType::Binocular => 2.0,
            PanoType::Sphere180 => 1.0,
            PanoType::Cylinder => PI / l.half_height,
            PanoType::CylinderSplit => PI / (4.0 * l.half_height),
            PanoType::Plane => {
                (l.h_fov_deg.to_radians() * 0.5).tan() / (l.v_fov_deg.to_radians() * 0.5).tan()
            }
            PanoType::Original => {
                let (cols, rows) = l.grid(self.camera_count);
                f64::from(cols * self.input_width) / f64::from(rows * self.input_height)
            }
        }
    }

    /// Full-resolution panorama size, limited to `max_dimension` on both axes
    pub fn native_size(&self, max_dimension: u32) -> (u32, u32) {
        let width = if self.layout.pano_type == PanoType::Original {
            f64::from(self.layout.grid(self.camera_count).0 * self.input_width)
        } else {
            f64::from(self.input_width) * self.camera_count as f64 * self.layout.crop
        };
        let height = width / self.aspect();
        let max = f64::from(max_dimension.max(1));
        let scale = (max / width).min(max / height).min(1.0);
        let w = (width * scale).round().max(1.0) as u32;
        let h = (height * scale).round().max(1.0) as u32;
        (w.min(max_dimension.max(1)), h.min(max_dimension.max(1)))
    }

    /// 3D point on the reference surface for a panorama coordinate
    pub fn surface_point(&self, uv: DVec2) -> DVec3 {
        match self.surface_kind() {
            SurfaceKind::Sphere => self.layout.uv_to_direction(uv).unwrap_or(DVec3::NEG_Z),
            SurfaceKind::Cylinder => {
                let lon = (uv.x - 0.5) * TAU;
                let h = (0.5 - uv.y) * 2.0 * self.layout.half_height;
                DVec3::new(lon.sin(), h, -lon.cos())
            }
            SurfaceKind::Plane => DVec3::new((uv.x - 0.5) * 2.0 * self.aspect(), (0.5 - uv.y) * 2.0, 0.0),
        }
    }

    /// Panorama coordinate where a ray first meets the drawn surface
    pub fn intersect(&self, origin: DVec3, direction: DVec3) -> Option<DVec2> {
        let dir = direction.try_normalize()?;
        match self.surface_kind() {
            SurfaceKind::Sphere => {
                // |o + t d|² = 1
                let b = origin.dot(dir);
                let c = origin.length_squared() - 1.0;
                positive_roots(1.0, 2.0 * b, c)
                    .into_iter()
                    .flatten()
                    .find_map(|t| self.layout.direction_to_uv(origin + dir * t))
            }
            SurfaceKind::Cylinder => {
                let a = dir.x * dir.x + dir.z * dir.z;
                let b = 2.0 * (origin.x * dir.x + origin.z * dir.z);
                let c = origin.x * origin.x + origin.z * origin.z - 1.0;
                positive_roots(a, b, c).into_iter().flatten().find_map(|t| {
                    let p = origin + dir * t;
                    (p.y.abs() <= self.layout.half_height).then(|| {
                        DVec2::new(p.x.atan2(-p.z) / TAU + 0.5, 0.5 - p.y / (2.0 * self.layout.half_height))
                    })
                })
            }
            SurfaceKind::Plane => {
                if dir.z.abs() < 1e-12 {
                    return None;
                }
                let t = -origin.z / dir.z;
                if t <= 0.0 {
                    return None;
                }
                let p = origin + dir * t;
                let uv = DVec2::new(p.x / (2.0 * self.aspect()) + 0.5, 0.5 - p.y * 0.5);
                ((0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y)).then_some(uv)
            }
        }
    }
}

pub fn surface_kind(pano_type: PanoType) -> SurfaceKind {
    match pano_type {
        PanoType::Sphere180 | PanoType::Sphere360 | PanoType::Sphere360Flipped => SurfaceKind::Sphere,
        PanoType::Cylinder => SurfaceKind::Cylinder,
        PanoType::CylinderSplit | PanoType::Plane | PanoType::Binocular | PanoType::Original => {
            SurfaceKind::Plane
        }
    }
}

/// Positive roots of `a t² + b t + c`, ascending
fn positive_roots(a: f64, b: f64, c: f64) -> [Option<f64>; 2] {
    if a.abs() < 1e-12 {
        return [None, None];
    }
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return [None, None];
    }
    let sq = disc.sqrt();
    let (t0, t1) = ((-b - sq) / (2.0 * a), (-b + sq) / (2.0 * a));
    let (t0, t1) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
    [(t0 > 1e-9).then_some(t0), (t1 > 1e-9).then_some(t1)]
}
