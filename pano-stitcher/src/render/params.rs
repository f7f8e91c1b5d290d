//! Pending and current render parameters
//!
//! The control surface writes the pending copy from any thread; once per
//! tick the scheduler applies it under the same lock, runs the cross-field
//! fixups and diffs it against the current copy to decide the tick's tasks.

use std::sync::Arc;

use crate::gpu::Viewport;
use crate::projection::{CalibrationProfile, PanoType};
use crate::surface::PanoGeometry;
use crate::view::{ViewCamera, ViewDof, MAX_ZOOM, MIN_ZOOM};

use super::tasks::DirtyFlags;

/// Everything the scheduler renders from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParameters {
    pub view: ViewDof,
    pub input_width: u32,
    pub input_height: u32,
    pub pano_type: PanoType,
    /// Output pixels the view is drawn into
    pub draw_region: Viewport,
}

impl RenderParameters {
    pub fn new(pano_type: PanoType, draw_region: Viewport) -> Self {
        Self {
            view: ViewDof::default(),
            input_width: 0,
            input_height: 0,
            pano_type,
            draw_region,
        }
    }

    pub fn has_input(&self) -> bool {
        self.input_width != 0 && self.input_height != 0
    }
}

/// Layouts whose horizontal coordinate wraps around
fn wraps_horizontally(pano_type: PanoType) -> bool {
    matches!(
        pano_type,
        PanoType::Sphere360 | PanoType::Sphere360Flipped | PanoType::Cylinder
    )
}

pub struct ParameterManager {
    profile: Arc<CalibrationProfile>,
    pending: RenderParameters,
    current: RenderParameters,
    view_set: bool,
    first_apply: bool,
}

impl ParameterManager {
    /// `initial.pano_type` falls back to the profile's first layout when unsupported
    pub fn new(profile: Arc<CalibrationProfile>, mut initial: RenderParameters) -> Self {
        if !profile.supports(initial.pano_type) {
            if let Some(layout) = profile.layouts().first() {
                initial.pano_type = layout.pano_type;
            }
        }
        Self {
            profile,
            pending: initial,
            current: initial,
            view_set: false,
            first_apply: true,
        }
    }

    pub fn set_view(&mut self, view: ViewDof) {
        self.pending.view = view;
        self.view_set = true;
    }

    pub fn set_pano_type(&mut self, pano_type: PanoType) {
        self.pending.pano_type = pano_type;
    }

    pub fn set_draw_region(&mut self, region: Viewport) {
        self.pending.draw_region = region;
    }

    pub fn set_input_size(&mut self, width: u32, height: u32) {
        self.pending.input_width = width;
        self.pending.input_height = height;
    }

    pub fn pending(&self) -> &RenderParameters {
        &self.pending
    }

    pub fn current(&self) -> &RenderParameters {
        &self.current
    }

    /// Geometry for the current parameters, once an input size is known
    pub fn current_geometry(&self) -> Option<PanoGeometry> {
        self.geometry(&self.current)
    }

    fn geometry(&self, params: &RenderParameters) -> Option<PanoGeometry> {
        if !params.has_input() {
            return None;
        }
        let layout = self.profile.layout(params.pano_type)?;
        Some(PanoGeometry::new(
            layout,
            self.profile.camera_count(),
            params.input_width,
            params.input_height,
        ))
    }

    /// Copy pending → current after the fixups and report what changed
    pub fn apply(&mut self) -> DirtyFlags {
        self.fix_pending();

        let (pending, current) = (&self.pending, &self.current);
        let flags = if self.first_apply {
            DirtyFlags {
                input_size: pending.has_input(),
                pano_type: true,
                draw_region: true,
                view: true,
            }
        } else {
            DirtyFlags {
                input_size: (pending.input_width, pending.input_height)
                    != (current.input_width, current.input_height),
                pano_type: pending.pano_type != current.pano_type,
                draw_region: pending.draw_region != current.draw_region,
                view: pending.view != current.view,
            }
        };

        self.current = self.pending;
        self.view_set = false;
        self.first_apply = false;
        flags
    }

    fn fix_pending(&mut self) {
        if !self.profile.supports(self.pending.pano_type) {
            tracing::warn!(
                "Pano type {} not supported by the profile, keeping {}",
                self.pending.pano_type,
                self.current.pano_type
            );
            self.pending.pano_type = self.current.pano_type;
        }

        let zoom = self.pending.view.zoom;
        self.pending.view.zoom = if zoom.is_nan() {
            self.current.view.zoom.clamp(MIN_ZOOM, MAX_ZOOM)
        } else {
            zoom.clamp(MIN_ZOOM, MAX_ZOOM)
        };

        if self.pending.pano_type != self.current.pano_type && !self.view_set {
            self.pending.view = ViewDof::default();
        }

        let view = &mut self.pending.view;
        if !view.horizontal.is_finite() {
            view.horizontal = self.current.view.horizontal;
        }
        if !view.vertical.is_finite() {
            view.vertical = self.current.view.vertical;
        }
        view.horizontal = if wraps_horizontally(self.pending.pano_type) {
            view.horizontal.rem_euclid(1.0)
        } else {
            view.horizontal.clamp(0.0, 1.0)
        };
        view.vertical = view.vertical.clamp(0.0, 1.0);

        if let Some(geometry) = self.geometry(&self.pending) {
            let camera = ViewCamera::for_geometry(&geometry, self.pending.view.zoom);
            let aspect = self.pending.draw_region.aspect() as f64;
            self.pending.view = camera.clamp(&self.pending.view, &geometry, aspect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{CameraModel, Intrinsics, LensType, PanoLayout};

    fn manager(types: &[PanoType]) -> ParameterManager {
        let cameras = vec![
            CameraModel::from_yaw_pitch_roll(LensType::Rectilinear, 0.0, 0.0, 0.0).with_intrinsics(
                64,
                48,
                Intrinsics {
                    fx: 20.0,
                    fy: 20.0,
                    cx: 32.0,
                    cy: 24.0,
                },
            ),
        ];
        let layouts = types.iter().map(|&t| PanoLayout::new(t)).collect();
        let profile = Arc::new(CalibrationProfile::new(cameras, layouts).unwrap());
        ParameterManager::new(profile, RenderParameters::new(types[0], Viewport::full(640, 480)))
    }

    #[test]
    fn test_unsupported_pano_type_rolls_back() {
        let mut params = manager(&[PanoType::Sphere360, PanoType::Cylinder]);
        params.apply();
        params.set_pano_type(PanoType::Binocular);
        let flags = params.apply();
        assert_eq!(params.current().pano_type, PanoType::Sphere360);
        assert!(!flags.pano_type);
    }

    #[test]
    fn test_zoom_clamped() {
        let mut params = manager(&[PanoType::Sphere360]);
        for (zoom, expected) in [(0.0, MIN_ZOOM), (-3.0, MIN_ZOOM), (50.0, MAX_ZOOM), (f64::INFINITY, MAX_ZOOM)] {
            params.set_view(ViewDof {
                zoom,
                ..ViewDof::default()
            });
            params.apply();
            assert_eq!(params.current().view.zoom, expected);
        }
        params.set_view(ViewDof {
            zoom: f64::NAN,
            ..ViewDof::default()
        });
        params.apply();
        assert_eq!(params.current().view.zoom, MAX_ZOOM);
    }

    #[test]
    fn test_non_finite_angles_keep_current_view() {
        let mut params = manager(&[PanoType::Sphere360]);
        params.set_view(ViewDof {
            horizontal: 0.2,
            vertical: 0.3,
            ..ViewDof::default()
        });
        params.apply();

        params.set_view(ViewDof {
            horizontal: f64::NAN,
            vertical: f64::NEG_INFINITY,
            ..ViewDof::default()
        });
        params.apply();
        assert_eq!(params.current().view.horizontal, 0.2);
        assert_eq!(params.current().view.vertical, 0.3);

        params.set_view(ViewDof {
            horizontal: f64::INFINITY,
            vertical: 0.4,
            ..ViewDof::default()
        });
        params.apply();
        assert_eq!(params.current().view.horizontal, 0.2);
        assert_eq!(params.current().view.vertical, 0.4);
    }

    #[test]
    fn test_no_change_is_clean() {
        let mut params = manager(&[PanoType::Sphere360]);
        let first = params.apply();
        assert!(first.draw_region && first.pano_type && !first.input_size);
        assert_eq!(params.apply(), DirtyFlags::default());

        let view = params.current().view;
        params.set_view(view);
        assert_eq!(params.apply(), DirtyFlags::default());
    }

    #[test]
    fn test_input_size_change() {
        let mut params = manager(&[PanoType::Sphere360]);
        params.apply();
        params.set_input_size(64, 48);
        let flags = params.apply();
        assert!(flags.input_size);
        assert!(params.current().has_input());
        assert!(params.current_geometry().is_some());
    }

    #[test]
    fn test_pano_switch_resets_framing() {
        let mut params = manager(&[PanoType::Sphere360, PanoType::Cylinder]);
        params.set_view(ViewDof {
            horizontal: 0.8,
            vertical: 0.3,
            zoom: 2.0,
        });
        params.apply();
        params.set_pano_type(PanoType::Cylinder);
        params.apply();
        assert_eq!(params.current().view, ViewDof::default());

        // A view set together with the switch is kept
        let wanted = ViewDof {
            horizontal: 0.2,
            vertical: 0.4,
            zoom: 1.5,
        };
        params.set_pano_type(PanoType::Sphere360);
        params.set_view(wanted);
        params.apply();
        assert_eq!(params.current().view, wanted);
    }

    #[test]
    fn test_horizontal_wraps_on_full_circle() {
        let mut params = manager(&[PanoType::Sphere360, PanoType::Sphere180]);
        params.set_view(ViewDof {
            horizontal: 1.25,
            vertical: 1.5,
            zoom: 1.0,
        });
        params.apply();
        assert!((params.current().view.horizontal - 0.25).abs() < 1e-12);
        assert_eq!(params.current().view.vertical, 1.0);

        params.set_pano_type(PanoType::Sphere180);
        params.set_view(ViewDof {
            horizontal: 1.25,
            vertical: 0.5,
            zoom: 1.0,
        });
        params.apply();
        assert_eq!(params.current().view.horizontal, 1.0);
    }

    #[test]
    fn test_orthogonal_view_clamped_to_canvas() {
        let mut params = manager(&[PanoType::Plane]);
        params.set_input_size(64, 48);
        params.set_view(ViewDof {
            horizontal: 0.0,
            vertical: 0.0,
            zoom: 4.0,
        });
        params.apply();
        let view = params.current().view;
        assert!(view.horizontal > 0.0);
        assert!(view.vertical > 0.0);
    }
}
