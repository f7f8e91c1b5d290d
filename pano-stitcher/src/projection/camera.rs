//! Calibrated camera model
//!
//! Rotation is camera-from-reference: `R * direction` gives the ray in the
//! camera's OpenCV frame. The reference frame is right-handed with +Y up and
//! forward along -Z; longitude grows towards +X.

use std::collections::BTreeMap;

use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use super::lens::{Distortion, LensType};
use crate::error::RecoverableError;

/// Pinhole intrinsic matrix in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Normalised image point to pixel
    pub fn apply(&self, point: DVec2) -> DVec2 {
        DVec2::new(self.fx * point.x + self.cx, self.fy * point.y + self.cy)
    }

    /// Pixel to normalised image point
    pub fn invert(&self, pixel: DVec2) -> DVec2 {
        DVec2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    /// Mean focal length in pixels
    pub fn focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    fn scaled(&self, sx: f64, sy: f64) -> Self {
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
        }
    }
}

/// Parse a `"WIDTHxHEIGHT"` resolution key
pub fn parse_resolution_key(key: &str) -> Option<(u32, u32)> {
    let (w, h) = key.split_once(['x', 'X'])?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

pub fn resolution_key(width: u32, height: u32) -> String {
    format!("{width}x{height}")
}

fn default_valid_radius() -> f64 {
    4.0
}

/// A calibrated camera, immutable after the profile is loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraModel {
    pub lens: LensType,
    /// Intrinsics per calibrated input resolution, keyed `"WIDTHxHEIGHT"`
    pub intrinsics: BTreeMap<String, Intrinsics>,
    #[serde(default)]
    pub distortion: Distortion,
    /// Rows of the camera-from-reference rotation
    pub rotation: [[f64; 3]; 3],
    /// Limit of trustworthy calibration, in the lens' undistorted radius domain
    #[serde(default = "default_valid_radius")]
    pub valid_radius: f64,
}

impl CameraModel {
    /// Camera looking along `yaw` (towards +X) and `pitch` (up), rolled
    /// clockwise by `roll` about its optical axis; angles in radians.
    pub fn from_yaw_pitch_roll(lens: LensType, yaw: f64, pitch: f64, roll: f64) -> Self {
        let (sy, cy) = yaw.sin_cos();
        let (sp, cp) = pitch.sin_cos();
        let (sr, cr) = roll.sin_cos();
        let forward = DVec3::new(cp * sy, sp, -cp * cy);
        let right0 = DVec3::new(cy, 0.0, sy);
        let up0 = right0.cross(forward);
        let right = right0 * cr + up0 * sr;
        let up = up0 * cr - right0 * sr;
        let down = -up;
        Self {
            lens,
            intrinsics: BTreeMap::new(),
            distortion: [0.0; 5],
            rotation: [right.to_array(), down.to_array(), forward.to_array()],
            valid_radius: default_valid_radius(),
        }
    }

    pub fn with_intrinsics(mut self, width: u32, height: u32, intrinsics: Intrinsics) -> Self {
        self.intrinsics.insert(resolution_key(width, height), intrinsics);
        self
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn with_valid_radius(mut self, valid_radius: f64) -> Self {
        self.valid_radius = valid_radius;
        self
    }

    /// Calibrated input resolutions, smallest key first
    pub fn resolutions(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.intrinsics.keys().filter_map(|key| parse_resolution_key(key))
    }

    /// Camera-from-reference rotation
    pub fn rotation_matrix(&self) -> DMat3 {
        // glam is column-major; the stored rows become the transpose's columns
        DMat3::from_cols_array_2d(&self.rotation).transpose()
    }

    /// Intrinsics for an input resolution.
    ///
    /// Falls back to scaling a calibrated resolution of the same aspect ratio.
    pub fn intrinsics_for(&self, width: u32, height: u32) -> Result<Intrinsics, RecoverableError> {
        if let Some(k) = self.intrinsics.get(&resolution_key(width, height)) {
            return Ok(*k);
        }
        self.intrinsics
            .iter()
            .filter_map(|(key, k)| parse_resolution_key(key).map(|res| (res, k)))
            .find(|((w, h), _)| u64::from(*w) * u64::from(height) == u64::from(width) * u64::from(*h))
            .map(|((w, h), k)| k.scaled(f64::from(width) / f64::from(w), f64::from(height) / f64::from(h)))
            .ok_or(RecoverableError::UnknownResolution { width, height })
    }

    /// Reference direction to camera ray
    pub fn to_camera(&self, direction: DVec3) -> DVec3 {
        self.rotation_matrix() * direction
    }

    /// Camera ray to reference direction
    pub fn to_reference(&self, ray: DVec3) -> DVec3 {
        self.rotation_matrix().transpose() * ray
    }

    pub(crate) fn validate(&self, index: usize) -> Result<(), RecoverableError> {
        if self.intrinsics.is_empty() {
            return Err(RecoverableError::InvalidProfile(format!(
                "camera {index} has no intrinsics"
            )));
        }
        for (key, k) in &self.intrinsics {
            if parse_resolution_key(key).is_none() {
                return Err(RecoverableError::InvalidProfile(format!(
                    "camera {index}: bad resolution key {key:?}"
                )));
            }
            if !(k.fx > 0.0 && k.fy > 0.0) {
                return Err(RecoverableError::InvalidProfile(format!(
                    "camera {index}: non-positive focal length at {key}"
                )));
            }
        }
        let r = self.rotation_matrix();
        if ((r * r.transpose()) - DMat3::IDENTITY)
            .to_cols_array()
            .iter()
            .any(|v| v.abs() > 1e-3)
        {
            return Err(RecoverableError::InvalidProfile(format!(
                "camera {index}: rotation is not orthonormal"
            )));
        }
        if !(self.valid_radius > 0.0) {
            return Err(RecoverableError::InvalidProfile(format!(
                "camera {index}: valid radius must be positive"
            )));
        }
        Ok(())
    }
}

/// Blend confidence of a sample at `pixel`.
///
/// Minimum of the distance to the image border (in focal lengths) and the
/// distance to the calibrated valid radius, clamped to zero.
pub fn edge_weight(
    pixel: DVec2,
    radius: f64,
    valid_radius: f64,
    width: u32,
    height: u32,
    intrinsics: &Intrinsics,
) -> f64 {
    let border = pixel
        .x
        .min(f64::from(width) - pixel.x)
        .min(pixel.y)
        .min(f64::from(height) - pixel.y);
    let border = border / intrinsics.focal();
    border.min(valid_radius - radius).max(0.0)
}
