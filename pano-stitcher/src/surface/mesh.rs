//! Mesh generation for reference surfaces
//!
//! Every surface is tessellated as a regular grid in panorama coordinates,
//! so each vertex carries both its 3D position and the `uv` the projectors
//! are evaluated at.

use bytemuck::{Pod, Zeroable};
use glam::DVec2;

use super::PanoGeometry;

/// Vertex of a reference surface
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SurfaceVertex {
    /// Position on the reference surface
    pub position: [f32; 3],
    /// Panorama coordinate
    pub uv: [f32; 2],
}

/// Generated mesh data
#[derive(Debug, Clone)]
pub struct SurfaceMesh {
    pub vertices: Vec<SurfaceVertex>,
    pub indices: Vec<u32>,
}

impl SurfaceMesh {
    /// Tessellate the geometry's surface into `columns` x `rows` cells.
    ///
    /// Cells are split into two triangles; sphere seams and poles keep their
    /// duplicated vertices so `uv` stays continuous within every triangle.
    pub fn for_pano(geometry: &PanoGeometry, columns: u32, rows: u32) -> Self {
        let columns = columns.clamp(1, 1024);
        let rows = rows.clamp(1, 1024);
        let mut vertices = Vec::with_capacity(((columns + 1) * (rows + 1)) as usize);
        let mut indices = Vec::with_capacity((columns * rows * 6) as usize);

        for r in 0..=rows {
            let v = f64::from(r) / f64::from(rows);
            for c in 0..=columns {
                let u = f64::from(c) / f64::from(columns);
                let p = geometry.surface_point(DVec2::new(u, v));
                vertices.push(SurfaceVertex {
                    position: p.as_vec3().to_array(),
                    uv: [u as f32, v as f32],
                });
            }
        }

        for r in 0..rows {
            for c in 0..columns {
                let top_left = r * (columns + 1) + c;
                let top_right = top_left + 1;
                let bottom_left = top_left + columns + 1;
                let bottom_right = bottom_left + 1;

                indices.extend_from_slice(&[top_left, bottom_left, top_right]);
                indices.extend_from_slice(&[top_right, bottom_left, bottom_right]);
            }
        }

        Self { vertices, indices }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Vertex indices of triangle `t`
    pub fn triangle(&self, t: usize) -> [u32; 3] {
        [self.indices[3 * t], self.indices[3 * t + 1], self.indices[3 * t + 2]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{PanoLayout, PanoType};

    #[test]
    fn test_grid_counts() {
        let g = PanoGeometry::new(&PanoLayout::new(PanoType::Sphere360), 2, 64, 64);
        let mesh = SurfaceMesh::for_pano(&g, 8, 4);
        assert_eq!(mesh.vertex_count(), 45);
        assert_eq!(mesh.triangle_count(), 64);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertex_count()));
    }

    #[test]
    fn test_sphere_vertices_on_unit_sphere() {
        let g = PanoGeometry::new(&PanoLayout::new(PanoType::Sphere180), 2, 64, 64);
        let mesh = SurfaceMesh::for_pano(&g, 16, 8);
        for v in &mesh.vertices {
            let [x, y, z] = v.position;
            assert!(((x * x + y * y + z * z).sqrt() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_plane_spans_canvas() {
        let g = PanoGeometry::new(&PanoLayout::new(PanoType::Binocular), 2, 64, 64);
        let mesh = SurfaceMesh::for_pano(&g, 4, 4);
        let first = mesh.vertices[0];
        let last = mesh.vertices[mesh.vertex_count() - 1];
        assert_eq!(first.position, [-2.0, 1.0, 0.0]);
        assert_eq!(last.position, [2.0, -1.0, 0.0]);
        assert_eq!(last.uv, [1.0, 1.0]);
    }
}
