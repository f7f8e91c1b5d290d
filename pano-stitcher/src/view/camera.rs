//! View cameras for the interactive panorama view
//!
//! Stateless: every matrix is recomputed per frame from the view DOF, the
//! active pano geometry and the draw region aspect.

use std::f64::consts::FRAC_PI_3;

use glam::{DMat4, DVec2, DVec3, Mat4};

use super::ViewDof;
use crate::surface::{PanoGeometry, SurfaceKind};

const NEAR: f64 = 0.01;
const FAR: f64 = 100.0;

/// Vertical field of view at zoom 1
const BASE_FOV: f64 = FRAC_PI_3;

/// Closest approach to the poles when looking up or down
const POLE_MARGIN: f64 = 0.01;

/// Orbit distance grows from 1 at zoom 1 to 3.5 at the minimum zoom
fn orbit_distance(zoom: f64) -> f64 {
    1.0 + (1.0 - zoom).max(0.0) / 0.7 * 2.5
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewMatrices {
    pub view: DMat4,
    pub projection: DMat4,
}

impl ViewMatrices {
    pub fn view_proj(&self) -> DMat4 {
        self.projection * self.view
    }

    /// Single-precision matrix for the blend programs
    pub fn uniform(&self) -> Mat4 {
        self.view_proj().as_mat4()
    }

    /// World-space ray through a normalised draw-region point (origin top-left)
    pub fn ray(&self, point: DVec2) -> Option<(DVec3, DVec3)> {
        let inverse = self.view_proj().inverse();
        let ndc = DVec2::new(point.x * 2.0 - 1.0, 1.0 - point.y * 2.0);
        let near = inverse.project_point3(ndc.extend(0.0));
        let far = inverse.project_point3(ndc.extend(1.0));
        let dir = (far - near).try_normalize()?;
        near.is_finite().then_some((near, dir))
    }
}

/// Which camera model draws the current layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewCamera {
    /// Orbiting a sphere from outside
    PerspectiveOutside,
    /// At the sphere centre looking out
    PerspectiveInside,
    /// Orbiting a cylinder from outside
    PerspectiveOutsideSurround,
    /// At the cylinder axis looking out
    PerspectiveInsideSurround,
    /// Flat canvas
    Orthogonal,
}

impl ViewCamera {
    pub fn select(kind: SurfaceKind, zoom: f64) -> Self {
        match (kind, zoom >= 1.0) {
            (SurfaceKind::Sphere, true) => ViewCamera::PerspectiveInside,
            (SurfaceKind::Sphere, false) => ViewCamera::PerspectiveOutside,
            (SurfaceKind::Cylinder, true) => ViewCamera::PerspectiveInsideSurround,
            (SurfaceKind::Cylinder, false) => ViewCamera::PerspectiveOutsideSurround,
            (SurfaceKind::Plane, _) => ViewCamera::Orthogonal,
        }
    }

    pub fn for_geometry(geometry: &PanoGeometry, zoom: f64) -> Self {
        Self::select(geometry.surface_kind(), zoom)
    }

    fn focus(geometry: &PanoGeometry, dof: &ViewDof) -> DVec3 {
        let v = dof.vertical.clamp(POLE_MARGIN, 1.0 - POLE_MARGIN);
        geometry.surface_point(DVec2::new(dof.horizontal, v))
    }

    /// View and projection for `dof`; `aspect` is the draw region's width over height
    pub fn matrices(self, dof: &ViewDof, geometry: &PanoGeometry, aspect: f64) -> ViewMatrices {
        let aspect = aspect.max(1e-6);
        match self {
            ViewCamera::PerspectiveInside | ViewCamera::PerspectiveInsideSurround => {
                let target = Self::focus(geometry, dof);
                let fov = BASE_FOV / dof.zoom.max(1.0);
                ViewMatrices {
                    view: DMat4::look_at_rh(DVec3::ZERO, target, DVec3::Y),
                    projection: DMat4::perspective_rh(fov, aspect, NEAR, FAR),
                }
            }
            ViewCamera::PerspectiveOutside | ViewCamera::PerspectiveOutsideSurround => {
                let focus = Self::focus(geometry, dof);
                let eye = focus.try_normalize().unwrap_or(DVec3::NEG_Z) * orbit_distance(dof.zoom);
                ViewMatrices {
                    view: DMat4::look_at_rh(eye, DVec3::ZERO, DVec3::Y),
                    projection: DMat4::perspective_rh(BASE_FOV, aspect, NEAR, FAR),
                }
            }
            ViewCamera::Orthogonal => {
                let dof = self.clamp(dof, geometry, aspect);
                let a = geometry.aspect();
                let centre = DVec3::new((dof.horizontal - 0.5) * 2.0 * a, (0.5 - dof.vertical) * 2.0, 0.0);
                let half_h = 1.0 / dof.zoom;
                let half_w = half_h * aspect;
                ViewMatrices {
                    view: DMat4::look_at_rh(centre + DVec3::Z, centre, DVec3::Y),
                    projection: DMat4::orthographic_rh(-half_w, half_w, -half_h, half_h, NEAR, 2.0),
                }
            }
        }
    }

    /// Keep the visible rectangle of the orthogonal view inside the canvas
    pub fn clamp(self, dof: &ViewDof, geometry: &PanoGeometry, aspect: f64) -> ViewDof {
        if self != ViewCamera::Orthogonal {
            return *dof;
        }
        let a = geometry.aspect();
        let half_h = 1.0 / dof.zoom;
        let half_w = half_h * aspect;
        let fit = |centre: f64, half: f64, extent: f64| {
            if half >= extent {
                0.0
            } else {
                centre.clamp(-extent + half, extent - half)
            }
        };
        let cx = fit((dof.horizontal - 0.5) * 2.0 * a, half_w, a);
        let cy = fit((0.5 - dof.vertical) * 2.0, half_h, 1.0);
        ViewDof {
            horizontal: cx / (2.0 * a) + 0.5,
            vertical: 0.5 - cy * 0.5,
            zoom: dof.zoom,
        }
    }

    /// DOF centring a physical direction, keeping `zoom`
    pub fn frame_direction(geometry: &PanoGeometry, direction: DVec3, zoom: f64) -> Option<ViewDof> {
        let uv = geometry.layout().direction_to_uv(direction)?;
        Some(ViewDof {
            horizontal: uv.x,
            vertical: uv.y,
            zoom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{PanoLayout, PanoType};
    use approx::assert_relative_eq;

    fn geometry(pano_type: PanoType) -> PanoGeometry {
        PanoGeometry::new(&PanoLayout::new(pano_type), 2, 1920, 1080)
    }

    #[test]
    fn test_camera_selection() {
        assert_eq!(ViewCamera::select(SurfaceKind::Sphere, 1.0), ViewCamera::PerspectiveInside);
        assert_eq!(ViewCamera::select(SurfaceKind::Sphere, 0.5), ViewCamera::PerspectiveOutside);
        assert_eq!(
            ViewCamera::select(SurfaceKind::Cylinder, 2.0),
            ViewCamera::PerspectiveInsideSurround
        );
        assert_eq!(
            ViewCamera::select(SurfaceKind::Cylinder, 0.3),
            ViewCamera::PerspectiveOutsideSurround
        );
        assert_eq!(ViewCamera::select(SurfaceKind::Plane, 0.3), ViewCamera::Orthogonal);
    }

    #[test]
    fn test_inside_view_looks_at_focus() {
        let g = geometry(PanoType::Sphere360);
        let dof = ViewDof {
            horizontal: 0.75,
            vertical: 0.5,
            zoom: 2.0,
        };
        let m = ViewCamera::PerspectiveInside.matrices(&dof, &g, 16.0 / 9.0);
        let (_, dir) = m.ray(DVec2::splat(0.5)).unwrap();
        assert_relative_eq!(dir.x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_orbit_distance_range() {
        assert_relative_eq!(orbit_distance(1.0), 1.0);
        assert_relative_eq!(orbit_distance(0.3), 3.5, epsilon = 1e-12);
    }

    #[test]
    fn test_orthogonal_clamp_keeps_rect_inside_canvas() {
        let g = geometry(PanoType::Binocular);
        let dof = ViewDof {
            horizontal: 0.0,
            vertical: 0.0,
            zoom: 1.0,
        };
        let clamped = ViewCamera::Orthogonal.clamp(&dof, &g, 1.0);
        assert_relative_eq!(clamped.horizontal, 0.25, epsilon = 1e-12);
        assert_relative_eq!(clamped.vertical, 0.5, epsilon = 1e-12);
        // Perspective cameras leave the DOF alone
        assert_eq!(ViewCamera::PerspectiveInside.clamp(&dof, &g, 1.0), dof);
    }

    #[test]
    fn test_frame_direction_centres_direction() {
        let g = geometry(PanoType::Sphere360);
        let dof = ViewCamera::frame_direction(&g, DVec3::X, 1.5).unwrap();
        assert_relative_eq!(dof.horizontal, 0.75, epsilon = 1e-9);
        assert_relative_eq!(dof.vertical, 0.5, epsilon = 1e-9);
        assert_relative_eq!(dof.zoom, 1.5);

        let g = geometry(PanoType::Cylinder);
        let dof = ViewCamera::frame_direction(&g, DVec3::NEG_Z, 1.0).unwrap();
        assert_relative_eq!(dof.horizontal, 0.5, epsilon = 1e-9);
        assert_relative_eq!(dof.vertical, 0.5, epsilon = 1e-9);
    }
}
