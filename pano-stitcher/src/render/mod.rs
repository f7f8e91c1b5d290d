//! Render object: parameters, task scheduling and the public control surface
//!
//! [`StitchRenderer`] is what callers hold. It owns one scheduler thread that
//! owns the graphics backend; the two sides share only the pending
//! parameters, the per-camera ring buffers, queued output requests and the
//! un-projection slot.

mod params;
mod scheduler;
mod state;
mod stitcher;
mod tasks;

pub use params::{ParameterManager, RenderParameters};
pub use scheduler::OutputMode;
pub use state::{AtomicRenderState, RenderState};
pub use stitcher::StitchRenderer;
pub use tasks::{DirtyFlags, TaskMask};
