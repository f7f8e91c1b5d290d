//! Lens distortion models
//!
//! Each model maps between a camera-frame ray (OpenCV axes: x right, y down,
//! z forward) and a distorted, normalised image point, i.e. a pixel before the
//! intrinsic matrix is applied.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use super::camera::Intrinsics;

/// Five distortion coefficients; meaning depends on the lens type
pub type Distortion = [f64; 5];

const EPSILON: f64 = 1e-9;
const RECTILINEAR_ITERATIONS: usize = 10;
const FISHEYE_ITERATIONS: usize = 20;

/// Lens model of a calibrated camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LensType {
    /// Pinhole with radial + tangential distortion `[k1, k2, p1, p2, k3]`
    #[default]
    Rectilinear,
    /// Fisheye, `θd = θ(1 + k1θ² + k2θ⁴ + k3θ⁶ + k4θ⁸)`, coefficients `[k1, k2, k3, k4, _]`
    FisheyeTheta,
    /// Fisheye, `r = a1θ + a2θ³ + a3θ⁵ + a4θ⁷ + a5θ⁹`, coefficients `[a1..a5]`
    FisheyeAngle,
}

/// Forward and inverse distortion for one lens family
pub trait LensModel {
    /// Camera ray to distorted normalised image point; `None` if the lens cannot see it
    fn distort(&self, ray: DVec3, d: &Distortion) -> Option<DVec2>;

    /// Distorted normalised image point to a unit camera ray
    fn undistort(&self, point: DVec2, d: &Distortion) -> DVec3;

    /// Radius of `ray` in the domain the calibrated valid radius is measured in
    fn undistorted_radius(&self, ray: DVec3) -> f64;
}

pub struct Rectilinear;

impl LensModel for Rectilinear {
    fn distort(&self, ray: DVec3, d: &Distortion) -> Option<DVec2> {
        if ray.z <= EPSILON {
            return None;
        }
        let [k1, k2, p1, p2, k3] = *d;
        let x = ray.x / ray.z;
        let y = ray.y / ray.z;
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
        Some(DVec2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        ))
    }

    fn undistort(&self, point: DVec2, d: &Distortion) -> DVec3 {
        let [k1, k2, p1, p2, k3] = *d;
        let (mut x, mut y) = (point.x, point.y);
        // Fixed iteration count; calibration tooling uses the same scheme
        for _ in 0..RECTILINEAR_ITERATIONS {
            let r2 = x * x + y * y;
            let icdist = 1.0 / (1.0 + r2 * (k1 + r2 * (k2 + r2 * k3)));
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (point.x - dx) * icdist;
            y = (point.y - dy) * icdist;
        }
        DVec3::new(x, y, 1.0).normalize()
    }

    fn undistorted_radius(&self, ray: DVec3) -> f64 {
        if ray.z <= EPSILON {
            return f64::INFINITY;
        }
        (ray.x * ray.x + ray.y * ray.y).sqrt() / ray.z
    }
}

pub struct FisheyeTheta;

impl FisheyeTheta {
    fn poly(theta: f64, d: &Distortion) -> (f64, f64) {
        let [k1, k2, k3, k4, _] = *d;
        let t2 = theta * theta;
        let value = theta * (1.0 + t2 * (k1 + t2 * (k2 + t2 * (k3 + t2 * k4))));
        let slope = 1.0 + t2 * (3.0 * k1 + t2 * (5.0 * k2 + t2 * (7.0 * k3 + t2 * 9.0 * k4)));
        (value, slope)
    }
}

impl LensModel for FisheyeTheta {
    fn distort(&self, ray: DVec3, d: &Distortion) -> Option<DVec2> {
        fisheye_distort(ray, |theta| Self::poly(theta, d).0)
    }

    fn undistort(&self, point: DVec2, d: &Distortion) -> DVec3 {
        fisheye_undistort(point, point.length(), |theta| Self::poly(theta, d))
    }

    fn undistorted_radius(&self, ray: DVec3) -> f64 {
        incidence_angle(ray)
    }
}

pub struct FisheyeAngle;

impl FisheyeAngle {
    fn poly(theta: f64, d: &Distortion) -> (f64, f64) {
        let [a1, a2, a3, a4, a5] = *d;
        let t2 = theta * theta;
        let value = theta * (a1 + t2 * (a2 + t2 * (a3 + t2 * (a4 + t2 * a5))));
        let slope = a1 + t2 * (3.0 * a2 + t2 * (5.0 * a3 + t2 * (7.0 * a4 + t2 * 9.0 * a5)));
        (value, slope)
    }
}

impl LensModel for FisheyeAngle {
    fn distort(&self, ray: DVec3, d: &Distortion) -> Option<DVec2> {
        fisheye_distort(ray, |theta| Self::poly(theta, d).0)
    }

    fn undistort(&self, point: DVec2, d: &Distortion) -> DVec3 {
        let r = point.length();
        // Start from the equidistant guess
        let guess = if d[0].abs() > EPSILON { r / d[0] } else { r };
        fisheye_undistort(point, guess, |theta| Self::poly(theta, d))
    }

    fn undistorted_radius(&self, ray: DVec3) -> f64 {
        incidence_angle(ray)
    }
}

fn incidence_angle(ray: DVec3) -> f64 {
    (ray.x * ray.x + ray.y * ray.y).sqrt().atan2(ray.z)
}

fn fisheye_distort(ray: DVec3, radius_of: impl Fn(f64) -> f64) -> Option<DVec2> {
    let planar = (ray.x * ray.x + ray.y * ray.y).sqrt();
    if planar < EPSILON {
        return if ray.z > 0.0 { Some(DVec2::ZERO) } else { None };
    }
    let r = radius_of(planar.atan2(ray.z));
    Some(DVec2::new(ray.x / planar * r, ray.y / planar * r))
}

/// Newton solve of `poly(θ) = |point|` followed by the ray reconstruction
fn fisheye_undistort(point: DVec2, guess: f64, poly: impl Fn(f64) -> (f64, f64)) -> DVec3 {
    let r = point.length();
    if r < EPSILON {
        return DVec3::Z;
    }
    let mut theta = guess;
    for _ in 0..FISHEYE_ITERATIONS {
        let (value, slope) = poly(theta);
        if slope.abs() < EPSILON {
            break;
        }
        theta -= (value - r) / slope;
    }
    let (sin, cos) = theta.sin_cos();
    DVec3::new(point.x / r * sin, point.y / r * sin, cos)
}

impl LensType {
    fn model(self) -> &'static dyn LensModel {
        match self {
            LensType::Rectilinear => &Rectilinear,
            LensType::FisheyeTheta => &FisheyeTheta,
            LensType::FisheyeAngle => &FisheyeAngle,
        }
    }

    /// Camera ray to pixel: forward distortion then the intrinsic matrix
    pub fn ray_to_pixel(self, ray: DVec3, intrinsics: &Intrinsics, d: &Distortion) -> Option<DVec2> {
        self.model().distort(ray, d).map(|p| intrinsics.apply(p))
    }

    /// Pixel to unit camera ray: inverse intrinsics then the inverse distortion
    pub fn pixel_to_ray(self, pixel: DVec2, intrinsics: &Intrinsics, d: &Distortion) -> DVec3 {
        self.model().undistort(intrinsics.invert(pixel), d)
    }

    /// Radius of `ray` in the valid-radius domain (normalised radius or incidence angle)
    pub fn undistorted_radius(self, ray: DVec3) -> f64 {
        self.model().undistorted_radius(ray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 960.0,
            cy: 540.0,
        }
    }

    fn fisheye_intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 600.0,
            fy: 600.0,
            cx: 960.0,
            cy: 960.0,
        }
    }

    /// Fraction of rays on a grid within `max_angle` of the axis that survive
    /// ray -> pixel -> ray within 1e-3
    fn round_trip_ratio(lens: LensType, k: &Intrinsics, d: &Distortion, max_angle: f64) -> f64 {
        let mut total = 0;
        let mut ok = 0;
        for i in 0..=20 {
            for j in 0..24 {
                let theta = max_angle * i as f64 / 20.0;
                let phi = std::f64::consts::TAU * j as f64 / 24.0;
                let ray = DVec3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos());
                total += 1;
                if let Some(pixel) = lens.ray_to_pixel(ray, k, d) {
                    let back = lens.pixel_to_ray(pixel, k, d);
                    if (back - ray).length() < 1e-3 {
                        ok += 1;
                    }
                }
            }
        }
        ok as f64 / total as f64
    }

    #[test]
    fn test_rectilinear_round_trip() {
        let d = [-0.12, 0.03, 0.001, -0.0005, -0.002];
        let ratio = round_trip_ratio(LensType::Rectilinear, &intrinsics(), &d, 50f64.to_radians());
        assert!(ratio >= 0.95, "ratio {ratio}");
    }

    #[test]
    fn test_fisheye_theta_round_trip() {
        let d = [0.02, -0.01, 0.002, -0.0003, 0.0];
        let ratio = round_trip_ratio(LensType::FisheyeTheta, &fisheye_intrinsics(), &d, 95f64.to_radians());
        assert!(ratio >= 0.95, "ratio {ratio}");
    }

    #[test]
    fn test_fisheye_angle_round_trip() {
        let d = [1.0, -0.03, 0.004, -0.0002, 0.0];
        let ratio = round_trip_ratio(LensType::FisheyeAngle, &fisheye_intrinsics(), &d, 95f64.to_radians());
        assert!(ratio >= 0.95, "ratio {ratio}");
    }

    #[test]
    fn test_optical_axis_hits_principal_point() {
        let k = intrinsics();
        for lens in [LensType::Rectilinear, LensType::FisheyeTheta, LensType::FisheyeAngle] {
            let d = if lens == LensType::FisheyeAngle { [1.0, 0.0, 0.0, 0.0, 0.0] } else { [0.0; 5] };
            let pixel = lens.ray_to_pixel(DVec3::Z, &k, &d).unwrap();
            assert!((pixel - DVec2::new(960.0, 540.0)).length() < 1e-9);
            let ray = lens.pixel_to_ray(DVec2::new(960.0, 540.0), &k, &d);
            assert!((ray - DVec3::Z).length() < 1e-9);
        }
    }

    #[test]
    fn test_rectilinear_rejects_rays_behind_camera() {
        assert!(LensType::Rectilinear
            .ray_to_pixel(DVec3::new(0.1, 0.0, -1.0), &intrinsics(), &[0.0; 5])
            .is_none());
        assert!(LensType::FisheyeTheta
            .ray_to_pixel(DVec3::new(0.1, 0.0, -1.0), &intrinsics(), &[0.0; 5])
            .is_some());
    }

    #[test]
    fn test_undistorted_radius_domains() {
        let ray = DVec3::new(1.0, 0.0, 1.0).normalize();
        assert!((LensType::Rectilinear.undistorted_radius(ray) - 1.0).abs() < 1e-12);
        let angle = LensType::FisheyeTheta.undistorted_radius(ray);
        assert!((angle - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }
}
