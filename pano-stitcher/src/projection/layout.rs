//! Panorama layouts
//!
//! A layout maps panorama coordinates `uv ∈ [0,1]²` (u right, v down) to
//! physical directions on the reference sphere and back. All mappings are
//! closed form.

use std::f64::consts::{FRAC_PI_2, PI, TAU};
use std::fmt;
use std::str::FromStr;

use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::error::RecoverableError;

/// Supported panorama layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum PanoType {
    /// Front hemisphere, equirectangular
    Sphere180,
    /// Full sphere, equirectangular, forward at the centre
    #[default]
    Sphere360,
    /// Full sphere, equirectangular, backward at the centre
    Sphere360Flipped,
    /// 360° cylinder with optional optical-axis tilt
    Cylinder,
    /// Cylinder cut in two: front half on top, back half below
    CylinderSplit,
    /// Flat rectilinear view with fixed field of view
    Plane,
    /// Front and back hemispheres as two equidistant discs side by side
    Binocular,
    /// Raw camera images in a grid, no stitching
    Original,
}

impl PanoType {
    pub const ALL: [PanoType; 8] = [
        PanoType::Sphere180,
        PanoType::Sphere360,
        PanoType::Sphere360Flipped,
        PanoType::Cylinder,
        PanoType::CylinderSplit,
        PanoType::Plane,
        PanoType::Binocular,
        PanoType::Original,
    ];

    /// Short name used on the command line and in logs
    pub fn name(&self) -> &'static str {
        match self {
            PanoType::Sphere180 => "sphere180",
            PanoType::Sphere360 => "sphere360",
            PanoType::Sphere360Flipped => "sphere360-flipped",
            PanoType::Cylinder => "cylinder",
            PanoType::CylinderSplit => "cylinder-split",
            PanoType::Plane => "plane",
            PanoType::Binocular => "binocular",
            PanoType::Original => "original",
        }
    }

    pub fn is_sphere(&self) -> bool {
        matches!(self, PanoType::Sphere180 | PanoType::Sphere360 | PanoType::Sphere360Flipped)
    }
}

impl fmt::Display for PanoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PanoType {
    type Err = RecoverableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PanoType::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RecoverableError::UnsupportedPanoType(s.to_string()))
    }
}

fn default_crop() -> f64 {
    1.0
}
fn default_half_height() -> f64 {
    0.5
}
fn default_plane_hfov() -> f64 {
    100.0
}
fn default_plane_vfov() -> f64 {
    60.0
}
fn default_window() -> f64 {
    180.0
}

/// Parameter set of one supported layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanoLayout {
    pub pano_type: PanoType,
    /// Share of each camera's width kept in the native panorama width
    #[serde(default = "default_crop")]
    pub crop: f64,
    /// Cylinder: rotation of the cylinder axis about reference X, degrees
    #[serde(default)]
    pub tilt_deg: f64,
    /// Cylinder: half height relative to the unit radius
    #[serde(default = "default_half_height")]
    pub half_height: f64,
    /// Plane: horizontal field of view, degrees
    #[serde(default = "default_plane_hfov")]
    pub h_fov_deg: f64,
    /// Plane: vertical field of view, degrees
    #[serde(default = "default_plane_vfov")]
    pub v_fov_deg: f64,
    /// Binocular: accepted azimuth span around each disc axis, degrees
    #[serde(default = "default_window")]
    pub azimuth_window_deg: f64,
    /// Binocular: accepted elevation span around each disc axis, degrees
    #[serde(default = "default_window")]
    pub elevation_window_deg: f64,
    /// Original: grid columns, 0 picks a near-square grid
    #[serde(default)]
    pub grid_columns: u32,
}

impl PanoLayout {
    /// Default parameter set for a layout type
    pub fn new(pano_type: PanoType) -> Self {
        Self {
            pano_type,
            crop: default_crop(),
            tilt_deg: 0.0,
            half_height: default_half_height(),
            h_fov_deg: default_plane_hfov(),
            v_fov_deg: default_plane_vfov(),
            azimuth_window_deg: default_window(),
            elevation_window_deg: default_window(),
            grid_columns: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RecoverableError> {
        let bad = |what: &str| {
            Err(RecoverableError::InvalidProfile(format!(
                "{} layout: {what}",
                self.pano_type
            )))
        };
        if !(self.crop > 0.0 && self.crop <= 1.0) {
            return bad("crop must be in (0, 1]");
        }
        if !(self.half_height > 0.0) {
            return bad("half height must be positive");
        }
        if !(self.h_fov_deg > 0.0 && self.h_fov_deg < 180.0 && self.v_fov_deg > 0.0 && self.v_fov_deg < 180.0) {
            return bad("plane field of view must be in (0, 180)");
        }
        if !(self.azimuth_window_deg > 0.0 && self.elevation_window_deg > 0.0) {
            return bad("binocular windows must be positive");
        }
        Ok(())
    }

    /// Grid shape for `cameras` tiles in the original layout
    pub fn grid(&self, cameras: usize) -> (u32, u32) {
        let n = cameras.max(1) as u32;
        let cols = if self.grid_columns > 0 {
            self.grid_columns.min(n)
        } else {
            (f64::from(n).sqrt().ceil() as u32).max(1)
        };
        (cols, n.div_ceil(cols))
    }

    fn tilt(&self) -> DMat3 {
        DMat3::from_rotation_x(self.tilt_deg.to_radians())
    }

    /// Panorama coordinate to physical direction
    pub fn uv_to_direction(&self, uv: DVec2) -> Option<DVec3> {
        match self.pano_type {
            PanoType::Sphere360 => Some(lon_lat_to_direction((uv.x - 0.5) * TAU, (0.5 - uv.y) * PI)),
            PanoType::Sphere360Flipped => {
                Some(lon_lat_to_direction((uv.x - 0.5) * TAU + PI, (0.5 - uv.y) * PI))
            }
            PanoType::Sphere180 => Some(lon_lat_to_direction((uv.x - 0.5) * PI, (0.5 - uv.y) * PI)),
            PanoType::Cylinder => {
                let lon = (uv.x - 0.5) * TAU;
                let h = (0.5 - uv.y) * 2.0 * self.half_height;
                Some(self.cylinder_direction(lon, h))
            }
            PanoType::CylinderSplit => {
                let (lon_offset, local_v) = if uv.y <= 0.5 { (0.0, uv.y * 2.0) } else { (PI, uv.y * 2.0 - 1.0) };
                let lon = (uv.x - 0.5) * PI + lon_offset;
                let h = (0.5 - local_v) * 2.0 * self.half_height;
                Some(self.cylinder_direction(lon, h))
            }
            PanoType::Plane => {
                let x = (uv.x - 0.5) * 2.0 * (self.h_fov_deg.to_radians() * 0.5).tan();
                let y = (0.5 - uv.y) * 2.0 * (self.v_fov_deg.to_radians() * 0.5).tan();
                Some(DVec3::new(x, y, -1.0).normalize())
            }
            PanoType::Binocular => self.binocular_direction(uv),
            PanoType::Original => None,
        }
    }

    /// Physical direction to panorama coordinate; `None` outside the layout
    pub fn direction_to_uv(&self, direction: DVec3) -> Option<DVec2> {
        let d = direction.try_normalize()?;
        match self.pano_type {
            PanoType::Sphere360 => {
                let (lon, lat) = direction_to_lon_lat(d);
                Some(DVec2::new(lon / TAU + 0.5, 0.5 - lat / PI))
            }
            PanoType::Sphere360Flipped => {
                let (lon, lat) = direction_to_lon_lat(d);
                Some(DVec2::new(wrap_angle(lon - PI) / TAU + 0.5, 0.5 - lat / PI))
            }
            PanoType::Sphere180 => {
                let (lon, lat) = direction_to_lon_lat(d);
                (lon.abs() <= FRAC_PI_2).then(|| DVec2::new(lon / PI + 0.5, 0.5 - lat / PI))
            }
            PanoType::Cylinder => {
                let (lon, h) = self.cylinder_coords(d)?;
                Some(DVec2::new(lon / TAU + 0.5, 0.5 - h / (2.0 * self.half_height)))
            }
            PanoType::CylinderSplit => {
                let (lon, h) = self.cylinder_coords(d)?;
                let local_v = 0.5 - h / (2.0 * self.half_height);
                if lon.abs() <= FRAC_PI_2 {
                    Some(DVec2::new(lon / PI + 0.5, local_v * 0.5))
                } else {
                    let back = wrap_angle(lon - PI);
                    Some(DVec2::new(back / PI + 0.5, 0.5 + local_v * 0.5))
                }
            }
            PanoType::Plane => {
                if d.z >= 0.0 {
                    return None;
                }
                let x = d.x / -d.z;
                let y = d.y / -d.z;
                let uv = DVec2::new(
                    0.5 + x / (2.0 * (self.h_fov_deg.to_radians() * 0.5).tan()),
                    0.5 - y / (2.0 * (self.v_fov_deg.to_radians() * 0.5).tan()),
                );
                in_unit_square(uv).then_some(uv)
            }
            PanoType::Binocular => self.binocular_uv(d),
            PanoType::Original => None,
        }
    }

    fn cylinder_direction(&self, lon: f64, h: f64) -> DVec3 {
        self.tilt() * DVec3::new(lon.sin(), h, -lon.cos()).normalize()
    }

    /// Untilted longitude and height on the unit cylinder
    fn cylinder_coords(&self, direction: DVec3) -> Option<(f64, f64)> {
        let p = self.tilt().transpose() * direction;
        let radial = (p.x * p.x + p.z * p.z).sqrt();
        if radial < 1e-12 {
            return None;
        }
        let h = p.y / radial;
        (h.abs() <= self.half_height).then(|| (p.x.atan2(-p.z), h))
    }

    /// Disc axes `(forward, right)` and centre u for the front or back disc
    fn disc(front: bool) -> (DVec3, DVec3, f64) {
        if front {
            (DVec3::NEG_Z, DVec3::X, 0.25)
        } else {
            (DVec3::Z, DVec3::NEG_X, 0.75)
        }
    }

    fn binocular_accepts(&self, d: DVec3, forward: DVec3, right: DVec3) -> bool {
        let azimuth = d.dot(right).atan2(d.dot(forward));
        let elevation = d.y.clamp(-1.0, 1.0).asin();
        azimuth.abs().to_degrees() <= self.azimuth_window_deg * 0.5
            && elevation.abs().to_degrees() <= self.elevation_window_deg * 0.5
    }

    fn binocular_direction(&self, uv: DVec2) -> Option<DVec3> {
        let front = uv.x < 0.5;
        let (forward, right, cu) = Self::disc(front);
        let a = (uv.x - cu) / 0.25;
        let b = (0.5 - uv.y) / 0.5;
        let rho = (a * a + b * b).sqrt();
        if rho > 1.0 {
            return None;
        }
        let theta = rho * FRAC_PI_2;
        let phi = b.atan2(a);
        let d = forward * theta.cos() + (right * phi.cos() + DVec3::Y * phi.sin()) * theta.sin();
        self.binocular_accepts(d, forward, right).then_some(d)
    }

    fn binocular_uv(&self, d: DVec3) -> Option<DVec2> {
        let front = d.z <= 0.0;
        let (forward, right, cu) = Self::disc(front);
        if !self.binocular_accepts(d, forward, right) {
            return None;
        }
        let theta = d.dot(forward).clamp(-1.0, 1.0).acos();
        let rho = theta / FRAC_PI_2;
        let phi = d.y.atan2(d.dot(right));
        Some(DVec2::new(cu + 0.25 * rho * phi.cos(), 0.5 - 0.5 * rho * phi.sin()))
    }
}

/// Longitude (towards +X) and latitude (towards +Y) to a unit direction
pub fn lon_lat_to_direction(lon: f64, lat: f64) -> DVec3 {
    let (sl, cl) = lon.sin_cos();
    let (sb, cb) = lat.sin_cos();
    DVec3::new(cb * sl, sb, -cb * cl)
}

/// Unit direction to `(longitude, latitude)`, longitude in `(-π, π]`
pub fn direction_to_lon_lat(d: DVec3) -> (f64, f64) {
    (d.x.atan2(-d.z), d.y.clamp(-1.0, 1.0).asin())
}

fn wrap_angle(a: f64) -> f64 {
    let mut a = (a + PI).rem_euclid(TAU) - PI;
    if a <= -PI {
        a += TAU;
    }
    a
}

fn in_unit_square(uv: DVec2) -> bool {
    (0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trip(layout: &PanoLayout, uv: DVec2) {
        let d = layout
            .uv_to_direction(uv)
            .unwrap_or_else(|| panic!("{} has no direction at {uv}", layout.pano_type));
        assert!((d.length() - 1.0).abs() < 1e-9);
        let back = layout
            .direction_to_uv(d)
            .unwrap_or_else(|| panic!("{} lost {uv}", layout.pano_type));
        assert!((back - uv).length() < 1e-9, "{}: {uv} -> {back}", layout.pano_type);
    }

    fn interior_grid() -> impl Iterator<Item = DVec2> {
        (1..10).flat_map(|i| (1..10).map(move |j| DVec2::new(i as f64 / 10.0 + 0.013, j as f64 / 10.0 + 0.007)))
    }

    #[test]
    fn test_layouts_round_trip() {
        for pano_type in [
            PanoType::Sphere180,
            PanoType::Sphere360,
            PanoType::Sphere360Flipped,
            PanoType::Cylinder,
            PanoType::CylinderSplit,
            PanoType::Plane,
        ] {
            let mut layout = PanoLayout::new(pano_type);
            layout.tilt_deg = 10.0;
            for uv in interior_grid().filter(|uv| uv.x < 1.0 && uv.y < 1.0) {
                assert_round_trip(&layout, uv);
            }
        }
    }

    #[test]
    fn test_binocular_round_trip_inside_discs() {
        let layout = PanoLayout::new(PanoType::Binocular);
        for uv in [
            DVec2::new(0.25, 0.5),
            DVec2::new(0.3, 0.4),
            DVec2::new(0.1, 0.6),
            DVec2::new(0.75, 0.5),
            DVec2::new(0.8, 0.25),
        ] {
            assert_round_trip(&layout, uv);
        }
        assert!(layout.uv_to_direction(DVec2::new(0.02, 0.02)).is_none());
    }

    #[test]
    fn test_binocular_windows_reject_outside_directions() {
        let mut layout = PanoLayout::new(PanoType::Binocular);
        layout.azimuth_window_deg = 90.0;
        // 60° to the right of forward
        assert!(layout.direction_to_uv(lon_lat_to_direction(60f64.to_radians(), 0.0)).is_none());
        assert!(layout.direction_to_uv(lon_lat_to_direction(30f64.to_radians(), 0.0)).is_some());
    }

    #[test]
    fn test_sphere360_centre_is_forward() {
        let layout = PanoLayout::new(PanoType::Sphere360);
        let d = layout.uv_to_direction(DVec2::new(0.5, 0.5)).unwrap();
        assert!((d - DVec3::NEG_Z).length() < 1e-12);
        // Quarter turn right lands on +X
        let d = layout.uv_to_direction(DVec2::new(0.75, 0.5)).unwrap();
        assert!((d - DVec3::X).length() < 1e-12);
        let flipped = PanoLayout::new(PanoType::Sphere360Flipped);
        let d = flipped.uv_to_direction(DVec2::new(0.5, 0.5)).unwrap();
        assert!((d - DVec3::Z).length() < 1e-12);
    }

    #[test]
    fn test_cylinder_rejects_poles() {
        let layout = PanoLayout::new(PanoType::Cylinder);
        assert!(layout.direction_to_uv(DVec3::Y).is_none());
        assert!(layout.direction_to_uv(DVec3::new(0.0, 0.9, -0.1)).is_none());
    }

    #[test]
    fn test_sphere180_rejects_rear() {
        let layout = PanoLayout::new(PanoType::Sphere180);
        assert!(layout.direction_to_uv(DVec3::Z).is_none());
    }

    #[test]
    fn test_pano_type_names_parse() {
        for t in PanoType::ALL {
            assert_eq!(t.name().parse::<PanoType>().unwrap(), t);
        }
        assert!(matches!(
            "dome".parse::<PanoType>(),
            Err(RecoverableError::UnsupportedPanoType(_))
        ));
    }

    #[test]
    fn test_grid_shape() {
        let layout = PanoLayout::new(PanoType::Original);
        assert_eq!(layout.grid(4), (2, 2));
        assert_eq!(layout.grid(5), (3, 2));
        assert_eq!(layout.grid(1), (1, 1));
    }
}
