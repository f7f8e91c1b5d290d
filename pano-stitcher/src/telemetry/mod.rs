//! Telemetry and logging infrastructure
//!
//! Structured logging and render-tick profiling.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogGuard};
pub use metrics::{FrameProfiler, FrameStats, RenderStats};
