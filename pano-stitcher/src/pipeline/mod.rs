//! Double-buffered transfer between host and GPU
//!
//! Uploads move decoded frames into per-camera textures; downloads bring
//! rendered output back through a pool of in-flight contexts.

mod download;
mod upload;

pub use download::{DownloadTask, FrameDownloadPipeline, GrabbedFrame, OutputFrame, OutputKind};
pub use upload::TextureUploadPipeline;
