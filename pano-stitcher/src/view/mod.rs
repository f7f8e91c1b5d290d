//! Interactive view: cameras, framing and pointer un-projection

mod camera;
mod unproject;

pub use camera::{ViewCamera, ViewMatrices};
pub use unproject::{unproject, unproject_batch, Unprojected};

use serde::{Deserialize, Serialize};

/// Smallest accepted zoom
pub const MIN_ZOOM: f64 = 0.3;
/// Largest accepted zoom
pub const MAX_ZOOM: f64 = 10.0;

/// Interactive view degrees of freedom.
///
/// `horizontal` and `vertical` are the panorama coordinate at the view
/// centre; `zoom` below 1 moves perspective cameras outside the surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewDof {
    pub horizontal: f64,
    pub vertical: f64,
    pub zoom: f64,
}

impl Default for ViewDof {
    fn default() -> Self {
        Self {
            horizontal: 0.5,
            vertical: 0.5,
            zoom: 1.0,
        }
    }
}
