//! Triangle → camera-subset grouping with normalised blend weights

use std::collections::HashMap;

use glam::DVec2;

use super::camera_set::{BucketIndex, CameraSet};
use super::{CameraSample, Patch};
use crate::projection::{Projection, Projector};
use crate::surface::SurfaceMesh;

/// Weight sharpening and subset limits for one build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendConfig {
    /// Raw edge weights are raised to this power before normalisation
    pub exponent: f64,
    /// Most cameras a single patch may blend
    pub max_cameras_per_patch: usize,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            exponent: 20.0,
            max_cameras_per_patch: 4,
        }
    }
}

/// Per-vertex projection into every camera, evaluated once per build
struct VertexSamples {
    cameras: usize,
    projections: Vec<Option<Projection>>,
    sharpened: Vec<f64>,
}

impl VertexSamples {
    fn evaluate(mesh: &SurfaceMesh, projectors: &[Box<dyn Projector>], exponent: f64) -> Self {
        let cameras = projectors.len();
        let mut projections = Vec::with_capacity(mesh.vertex_count() * cameras);
        let mut sharpened = Vec::with_capacity(mesh.vertex_count() * cameras);
        for vertex in &mesh.vertices {
            let uv = DVec2::new(f64::from(vertex.uv[0]), f64::from(vertex.uv[1]));
            for projector in projectors {
                let projection = projector.project(uv);
                let raw = projection.map_or(0.0, |p| p.weight.max(0.0));
                projections.push(projection);
                sharpened.push(raw.powf(exponent));
            }
        }
        Self {
            cameras,
            projections,
            sharpened,
        }
    }

    fn projection(&self, vertex: u32, camera: usize) -> Option<&Projection> {
        self.projections[vertex as usize * self.cameras + camera].as_ref()
    }

    fn weight(&self, vertex: u32, camera: usize) -> f64 {
        self.sharpened[vertex as usize * self.cameras + camera]
    }
}

/// Patch under construction
struct Bucket {
    key: CameraSet,
    cameras: Vec<usize>,
    local: HashMap<u32, u32>,
    patch: Patch,
}

impl Bucket {
    fn new(key: CameraSet) -> Self {
        let cameras: Vec<usize> = key.iter().collect();
        Self {
            key,
            patch: Patch {
                key,
                cameras: cameras.clone(),
                vertices: Vec::new(),
                indices: Vec::new(),
                triangles: Vec::new(),
                samples: vec![Vec::new(); cameras.len()],
            },
            cameras,
            local: HashMap::new(),
        }
    }

    /// Local index of a mesh vertex, appending it with normalised samples on first use
    fn vertex(&mut self, mesh: &SurfaceMesh, samples: &VertexSamples, vertex: u32) -> u32 {
        if let Some(&local) = self.local.get(&vertex) {
            return local;
        }
        let local = self.patch.vertices.len() as u32;
        self.patch.vertices.push(mesh.vertices[vertex as usize]);
        let sum: f64 = self.cameras.iter().map(|&c| samples.weight(vertex, c)).sum();
        for (slot, &camera) in self.cameras.iter().enumerate() {
            let texcoord = samples
                .projection(vertex, camera)
                .map_or([0.0, 0.0], |p| p.texcoord.as_vec2().to_array());
            let weight = if sum > 0.0 { samples.weight(vertex, camera) / sum } else { 0.0 };
            self.patch.samples[slot].push(CameraSample {
                texcoord,
                weight: weight as f32,
            });
        }
        self.local.insert(vertex, local);
        local
    }
}

/// Group every triangle of `mesh` into patches keyed by covering cameras.
///
/// Patches come back sorted by key. The empty-key patch, if any, holds the
/// uncovered triangles.
pub fn build_patches(mesh: &SurfaceMesh, projectors: &[Box<dyn Projector>], config: &BlendConfig) -> Vec<Patch> {
    let samples = VertexSamples::evaluate(mesh, projectors, config.exponent);
    let cap = config.max_cameras_per_patch.max(1);
    let mut index = BucketIndex::with_capacity(projectors.len() * 4);
    let mut buckets: Vec<Bucket> = Vec::with_capacity(projectors.len() * 4);
    let mut capped = 0usize;

    for t in 0..mesh.triangle_count() {
        let tri = mesh.triangle(t);
        let mut candidates: Vec<usize> = (0..projectors.len())
            .filter(|&c| {
                tri.iter()
                    .any(|&v| samples.projection(v, c).is_some_and(Projection::is_inside))
            })
            .collect();

        if candidates.len() > cap {
            capped += 1;
            let score = |c: usize| tri.iter().map(|&v| samples.weight(v, c)).sum::<f64>();
            // Highest summed weight first; equal weights keep the lower camera index
            candidates.sort_by(|&a, &b| score(b).total_cmp(&score(a)).then(a.cmp(&b)));
            candidates.truncate(cap);
        }

        let key: CameraSet = candidates.into_iter().collect();
        let bucket = index.get_or_insert_with(key, || {
            buckets.push(Bucket::new(key));
            (buckets.len() - 1) as u32
        }) as usize;

        let bucket = &mut buckets[bucket];
        for v in tri {
            let local = bucket.vertex(mesh, &samples, v);
            bucket.patch.indices.push(local);
        }
        bucket.patch.triangles.push(t as u32);
    }

    if capped > 0 {
        tracing::debug!(
            "{} triangles exceeded the {}-camera patch limit and were reduced",
            capped,
            cap
        );
    }

    let mut patches: Vec<Patch> = buckets.into_iter().map(|b| b.patch).collect();
    patches.sort_by_key(|p| p.key);
    debug_assert!(patches.windows(2).all(|w| w[0].key != w[1].key));
    debug_assert!(patches.iter().all(|p| p.key == CameraSet::from_iter(p.cameras.iter().copied())));
    patches
}
