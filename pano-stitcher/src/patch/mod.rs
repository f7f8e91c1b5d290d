//! Overlap and blend precomputation
//!
//! Splits a tessellated surface into patches: groups of triangles covered by
//! the same subset of cameras. Each patch carries, per vertex and per
//! covering camera, the texture coordinate and a normalised blend weight.

mod builder;
mod camera_set;

pub use builder::{build_patches, BlendConfig};
pub use camera_set::{BucketIndex, CameraSet};

use crate::surface::SurfaceVertex;

/// One camera's contribution at a patch vertex
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSample {
    /// Normalised texture coordinate in the camera image
    pub texcoord: [f32; 2],
    /// Normalised blend weight
    pub weight: f32,
}

/// Triangles sharing one camera subset
#[derive(Debug, Clone)]
pub struct Patch {
    pub key: CameraSet,
    /// Covering cameras, ascending
    pub cameras: Vec<usize>,
    /// Patch-local vertices
    pub vertices: Vec<SurfaceVertex>,
    /// Patch-local triangle list
    pub indices: Vec<u32>,
    /// Source mesh triangle ids
    pub triangles: Vec<u32>,
    /// `samples[slot][vertex]` for `cameras[slot]`
    pub samples: Vec<Vec<CameraSample>>,
}

impl Patch {
    /// Floats per interleaved vertex: position, uv, then `(u, v, w)` per camera
    pub fn stride_floats(camera_count: usize) -> usize {
        5 + 3 * camera_count
    }

    /// Vertex data laid out `[x, y, z, u, v, (tu, tv, w) x cameras]`
    pub fn interleaved(&self) -> Vec<f32> {
        let stride = Self::stride_floats(self.cameras.len());
        let mut data = Vec::with_capacity(self.vertices.len() * stride);
        for (i, vertex) in self.vertices.iter().enumerate() {
            data.extend_from_slice(&vertex.position);
            data.extend_from_slice(&vertex.uv);
            for samples in &self.samples {
                let s = samples[i];
                data.extend_from_slice(&[s.texcoord[0], s.texcoord[1], s.weight]);
            }
        }
        data
    }

    /// Whether the patch is drawn at all
    pub fn is_renderable(&self) -> bool {
        !self.key.is_empty() && !self.indices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_layout() {
        let patch = Patch {
            key: CameraSet::from_bits(0b101),
            cameras: vec![0, 2],
            vertices: vec![SurfaceVertex {
                position: [1.0, 2.0, 3.0],
                uv: [0.25, 0.75],
            }],
            indices: vec![0, 0, 0],
            triangles: vec![0],
            samples: vec![
                vec![CameraSample { texcoord: [0.1, 0.2], weight: 0.6 }],
                vec![CameraSample { texcoord: [0.3, 0.4], weight: 0.4 }],
            ],
        };
        assert_eq!(Patch::stride_floats(2), 11);
        assert_eq!(
            patch.interleaved(),
            vec![1.0, 2.0, 3.0, 0.25, 0.75, 0.1, 0.2, 0.6, 0.3, 0.4, 0.4]
        );
        assert!(patch.is_renderable());
    }
}
