//! Screen → panorama → physical direction

use glam::{DVec2, DVec3};

use super::camera::ViewMatrices;
use crate::surface::PanoGeometry;

/// Where a draw-region point lands on the panorama
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unprojected {
    /// Panorama coordinate in `[0, 1]²`
    pub uv: DVec2,
    /// Physical direction; `None` for layouts without one (original grid)
    pub direction: Option<DVec3>,
}

/// Un-project a normalised draw-region point (origin top-left).
///
/// `None` when the ray misses the drawn surface.
pub fn unproject(matrices: &ViewMatrices, geometry: &PanoGeometry, point: DVec2) -> Option<Unprojected> {
    let (origin, dir) = matrices.ray(point)?;
    let uv = geometry.intersect(origin, dir)?;
    Some(Unprojected {
        uv,
        direction: geometry.layout().uv_to_direction(uv),
    })
}

/// Un-project a batch of points with one set of matrices
pub fn unproject_batch(matrices: &ViewMatrices, geometry: &PanoGeometry, points: &[DVec2]) -> Vec<Option<Unprojected>> {
    points.iter().map(|&p| unproject(matrices, geometry, p)).collect()
}
