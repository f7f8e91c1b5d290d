//! Camera projection model
//!
//! Maps between a camera's distorted pixel space, its undistorted ray space
//! and the shared physical-direction sphere, for every supported lens and
//! panorama layout.

mod camera;
mod layout;
mod lens;
mod projector;

pub use camera::{edge_weight, parse_resolution_key, resolution_key, CameraModel, Intrinsics};
pub use layout::{direction_to_lon_lat, lon_lat_to_direction, PanoLayout, PanoType};
pub use lens::{Distortion, FisheyeAngle, FisheyeTheta, LensModel, LensType, Rectilinear};
pub use projector::{create_projectors, GridProjector, Projection, Projector, StitchProjector};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RecoverableError;

/// Cameras addressable by a single patch key
pub const MAX_CAMERAS: usize = 64;

/// On-disk shape of a calibration profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileDocument {
    cameras: Vec<CameraModel>,
    layouts: Vec<PanoLayout>,
}

/// Calibrated cameras plus the layouts they support.
///
/// Loaded once per renderer; camera models are shared read-only by every
/// projector built from them.
#[derive(Debug, Clone)]
pub struct CalibrationProfile {
    cameras: Vec<Arc<CameraModel>>,
    layouts: Vec<PanoLayout>,
}

impl CalibrationProfile {
    pub fn new(cameras: Vec<CameraModel>, layouts: Vec<PanoLayout>) -> Result<Self, RecoverableError> {
        if cameras.is_empty() {
            return Err(RecoverableError::InvalidProfile("no cameras".into()));
        }
        if cameras.len() > MAX_CAMERAS {
            return Err(RecoverableError::InvalidProfile(format!(
                "{} cameras exceeds the limit of {MAX_CAMERAS}",
                cameras.len()
            )));
        }
        if layouts.is_empty() {
            return Err(RecoverableError::InvalidProfile("no supported layouts".into()));
        }
        for (i, camera) in cameras.iter().enumerate() {
            camera.validate(i)?;
        }
        for (i, layout) in layouts.iter().enumerate() {
            layout.validate()?;
            if layouts[..i].iter().any(|l| l.pano_type == layout.pano_type) {
                return Err(RecoverableError::InvalidProfile(format!(
                    "layout {} listed twice",
                    layout.pano_type
                )));
            }
        }
        Ok(Self {
            cameras: cameras.into_iter().map(Arc::new).collect(),
            layouts,
        })
    }

    /// Parse and validate a JSON profile
    pub fn from_json_str(json: &str) -> Result<Self, RecoverableError> {
        let doc: ProfileDocument =
            serde_json::from_str(json).map_err(|e| RecoverableError::InvalidProfile(e.to_string()))?;
        Self::new(doc.cameras, doc.layouts)
    }

    pub fn to_json_string(&self) -> Result<String, RecoverableError> {
        let doc = ProfileDocument {
            cameras: self.cameras.iter().map(|c| c.as_ref().clone()).collect(),
            layouts: self.layouts.clone(),
        };
        serde_json::to_string_pretty(&doc).map_err(|e| RecoverableError::InvalidProfile(e.to_string()))
    }

    pub fn cameras(&self) -> &[Arc<CameraModel>] {
        &self.cameras
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn layouts(&self) -> &[PanoLayout] {
        &self.layouts
    }

    /// Parameter set for a layout, if supported
    pub fn layout(&self, pano_type: PanoType) -> Option<&PanoLayout> {
        self.layouts.iter().find(|l| l.pano_type == pano_type)
    }

    pub fn supports(&self, pano_type: PanoType) -> bool {
        self.layout(pano_type).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "cameras": [
            {
                "lens": "FisheyeTheta",
                "intrinsics": { "1920x1920": { "fx": 600.0, "fy": 600.0, "cx": 960.0, "cy": 960.0 } },
                "distortion": [0.01, 0.0, 0.0, 0.0, 0.0],
                "rotation": [[1, 0, 0], [0, -1, 0], [0, 0, -1]],
                "validRadius": 1.6
            }
        ],
        "layouts": [ { "panoType": "Sphere360" }, { "panoType": "Cylinder", "halfHeight": 0.4 } ]
    }"#;

    #[test]
    fn test_profile_from_json() {
        let profile = CalibrationProfile::from_json_str(PROFILE).unwrap();
        assert_eq!(profile.camera_count(), 1);
        assert_eq!(profile.cameras()[0].lens, LensType::FisheyeTheta);
        assert!(profile.supports(PanoType::Cylinder));
        assert!(!profile.supports(PanoType::Plane));
        assert_eq!(profile.layout(PanoType::Cylinder).unwrap().half_height, 0.4);
        assert_eq!(profile.layout(PanoType::Sphere360).unwrap().crop, 1.0);

        let again = CalibrationProfile::from_json_str(&profile.to_json_string().unwrap()).unwrap();
        assert_eq!(*again.cameras()[0], *profile.cameras()[0]);
    }

    #[test]
    fn test_profile_rejects_empty_and_duplicate() {
        assert!(matches!(
            CalibrationProfile::from_json_str(r#"{"cameras": [], "layouts": []}"#),
            Err(RecoverableError::InvalidProfile(_))
        ));
        let camera = CameraModel::from_yaw_pitch_roll(LensType::Rectilinear, 0.0, 0.0, 0.0).with_intrinsics(
            64,
            64,
            Intrinsics {
                fx: 32.0,
                fy: 32.0,
                cx: 32.0,
                cy: 32.0,
            },
        );
        let layouts = vec![PanoLayout::new(PanoType::Plane), PanoLayout::new(PanoType::Plane)];
        assert!(CalibrationProfile::new(vec![camera], layouts).is_err());
    }

    #[test]
    fn test_malformed_json_is_recoverable() {
        assert!(matches!(
            CalibrationProfile::from_json_str("{"),
            Err(RecoverableError::InvalidProfile(_))
        ));
    }
}
