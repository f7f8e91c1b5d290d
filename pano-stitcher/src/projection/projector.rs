//! Per-camera projectors from panorama coordinates to camera texture coordinates

use std::sync::Arc;

use glam::DVec2;

use super::camera::{edge_weight, CameraModel, Intrinsics};
use super::layout::{PanoLayout, PanoType};
use super::CalibrationProfile;
use crate::error::RecoverableError;

/// Where a panorama point lands in one camera's image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Normalised image coordinate; inside the image when within `[0,1]²`
    pub texcoord: DVec2,
    /// Raw blend confidence before sharpening and normalisation
    pub weight: f64,
}

impl Projection {
    pub fn is_inside(&self) -> bool {
        (0.0..=1.0).contains(&self.texcoord.x) && (0.0..=1.0).contains(&self.texcoord.y)
    }
}

/// Maps panorama coordinates into one camera's texture
pub trait Projector: Send + Sync {
    /// Camera this projector samples
    fn camera_index(&self) -> usize;

    /// `None` when the camera cannot see the point at all
    fn project(&self, uv: DVec2) -> Option<Projection>;
}

/// Layout → rotation → lens → intrinsics
pub struct StitchProjector {
    index: usize,
    camera: Arc<CameraModel>,
    layout: PanoLayout,
    intrinsics: Intrinsics,
    width: u32,
    height: u32,
}

impl StitchProjector {
    pub fn new(
        index: usize,
        camera: Arc<CameraModel>,
        layout: PanoLayout,
        width: u32,
        height: u32,
    ) -> Result<Self, RecoverableError> {
        let intrinsics = camera.intrinsics_for(width, height)?;
        Ok(Self {
            index,
            camera,
            layout,
            intrinsics,
            width,
            height,
        })
    }
}

impl Projector for StitchProjector {
    fn camera_index(&self) -> usize {
        self.index
    }

    fn project(&self, uv: DVec2) -> Option<Projection> {
        let direction = self.layout.uv_to_direction(uv)?;
        let ray = self.camera.to_camera(direction);
        let lens = self.camera.lens;
        let pixel = lens.ray_to_pixel(ray, &self.intrinsics, &self.camera.distortion)?;
        let weight = edge_weight(
            pixel,
            lens.undistorted_radius(ray),
            self.camera.valid_radius,
            self.width,
            self.height,
            &self.intrinsics,
        );
        Some(Projection {
            texcoord: pixel / DVec2::new(f64::from(self.width), f64::from(self.height)),
            weight,
        })
    }
}

/// One tile of the original-grid layout showing a camera image unmodified
pub struct GridProjector {
    index: usize,
    column: u32,
    row: u32,
    columns: u32,
    rows: u32,
}

impl GridProjector {
    pub fn new(index: usize, columns: u32, rows: u32) -> Self {
        let columns = columns.max(1);
        Self {
            index,
            column: index as u32 % columns,
            row: index as u32 / columns,
            columns,
            rows: rows.max(1),
        }
    }
}

impl Projector for GridProjector {
    fn camera_index(&self) -> usize {
        self.index
    }

    fn project(&self, uv: DVec2) -> Option<Projection> {
        let mut projection = Projection {
            texcoord: DVec2::new(
                uv.x * f64::from(self.columns) - f64::from(self.column),
                uv.y * f64::from(self.rows) - f64::from(self.row),
            ),
            weight: 0.0,
        };
        if projection.is_inside() {
            projection.weight = 1.0;
        }
        Some(projection)
    }
}

/// Build one projector per camera for `layout` at the given input resolution
pub fn create_projectors(
    profile: &CalibrationProfile,
    layout: &PanoLayout,
    width: u32,
    height: u32,
) -> Result<Vec<Box<dyn Projector>>, RecoverableError> {
    let cameras = profile.cameras();
    if layout.pano_type == PanoType::Original {
        let (columns, rows) = layout.grid(cameras.len());
        return Ok((0..cameras.len())
            .map(|i| Box::new(GridProjector::new(i, columns, rows)) as Box<dyn Projector>)
            .collect());
    }
    cameras
        .iter()
        .enumerate()
        .map(|(i, camera)| {
            StitchProjector::new(i, Arc::clone(camera), layout.clone(), width, height)
                .map(|p| Box::new(p) as Box<dyn Projector>)
        })
        .collect()
}
