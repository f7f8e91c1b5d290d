//! Pano Stitcher Library
//!
//! Multi-camera panoramic stitching core: per-camera frame queues, lens and
//! layout projection, patch-based blending on a tessellated reference
//! surface, and a scheduler thread that owns the graphics context and drives
//! rendering, snapshots and interactive views.

pub mod error;
pub mod frame;
pub mod gpu;
pub mod patch;
pub mod pipeline;
pub mod projection;
pub mod render;
pub mod scene;
pub mod settings;
pub mod surface;
pub mod telemetry;
pub mod view;

pub use error::{FatalFault, GpuError, RecoverableError, RenderError};
pub use frame::{FrameHeader, FrameRingBuffer, FrameView, OverflowPolicy, PixelFormat, RingBufferConfig};
pub use gpu::{BackendFactory, GraphicsBackend, GraphicsCapabilities, SoftwareBackend, Viewport, WgpuBackend};
pub use pipeline::{OutputFrame, OutputKind};
pub use projection::{CalibrationProfile, CameraModel, Intrinsics, LensType, PanoLayout, PanoType};
pub use render::{OutputMode, RenderState, StitchRenderer};
pub use scene::{RenderScene, SceneConfig};
pub use settings::StitcherSettings;
pub use view::{Unprojected, ViewDof};
