//! Error types for the stitching core
//!
//! Per-call failures are reported as [`RecoverableError`] and never change the
//! render object's state. Failures inside the scheduler thread are wrapped in a
//! [`FatalFault`], which only the task loop observes and turns into the
//! terminal `Error` state. Public calls surface both through [`RenderError`].

use thiserror::Error;

use crate::render::RenderState;

/// Failures local to a single call; the caller may drop the input and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoverableError {
    /// Ring buffer is full and configured to reject new frames
    #[error("ring buffer full ({needed} bytes requested)")]
    RingBufferFull { needed: usize },

    /// Frame cannot fit even in a fully grown ring buffer
    #[error("frame of {size} bytes exceeds ring buffer limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Camera index outside the loaded calibration
    #[error("unknown camera index {0}")]
    UnknownCamera(usize),

    /// Pano type not present in the supported layout list
    #[error("unsupported pano type: {0}")]
    UnsupportedPanoType(String),

    /// Frame planes do not match the declared format and size
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// No intrinsics calibrated for this input resolution
    #[error("no intrinsics for resolution {width}x{height}")]
    UnknownResolution { width: u32, height: u32 },

    /// Control-surface parameter out of its accepted domain
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Calibration profile could not be parsed or is inconsistent
    #[error("invalid calibration profile: {0}")]
    InvalidProfile(String),
}

/// Failures reported by a graphics backend verb.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("no suitable graphics adapter found")]
    NoAdapter,

    #[error("failed to create graphics device: {0}")]
    DeviceRequest(String),

    #[error("shader program compilation failed: {0}")]
    ShaderCompile(String),

    #[error("resource size {requested} exceeds device limit {limit}")]
    ResourceLimit { requested: u32, limit: u32 },

    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },

    #[error("staging buffer map failed: {0}")]
    MapFailed(String),

    #[error("graphics context lost: {0}")]
    ContextLost(String),
}

/// One-way fault signal raised inside the scheduler thread.
#[derive(Debug, Clone, Error)]
pub enum FatalFault {
    #[error("graphics failure: {0}")]
    Gpu(#[from] GpuError),

    #[error("scene construction failed: {0}")]
    Scene(String),

    #[error("scheduler task panicked: {0}")]
    Panic(String),
}

/// Error returned across the public control surface.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error(transparent)]
    Recoverable(#[from] RecoverableError),

    #[error("operation not available in state {0:?}")]
    InvalidState(RenderState),

    #[error("graphics initialisation failed: {0}")]
    Graphics(GpuError),

    #[error("render object has failed; destroy and recreate it")]
    Failed,

    #[error("timed out waiting for the render thread")]
    Timeout,
}
