//! GPU → host output download
//!
//! A small ring of download contexts, each owning an offscreen target and a
//! staging buffer. The scheduler renders into a context, submits the copy,
//! and collects it on a later tick once the backend reports it mapped, so a
//! slow readback never stalls the render loop.

use bytes::Bytes;

use crate::error::GpuError;
use crate::gpu::{GraphicsBackend, StagingId, TargetId};

/// Why a frame was downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Full panorama at native resolution
    Snapshot,
    /// Current view for the registered output callback
    View,
}

/// Downloaded RGBA image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8, top row first
    pub data: Bytes,
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    /// Free for a new task
    Available,
    /// Rendered and copy submitted
    Pending,
    /// Bytes landed and handed out by `grab`, awaiting `release`
    Ready,
}

struct DownloadContext {
    target: TargetId,
    staging: StagingId,
    width: u32,
    height: u32,
    state: ContextState,
    kind: OutputKind,
    sequence: u64,
    data: Vec<u8>,
}

/// Slot reserved by `create_task`; render into `target`, then `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadTask {
    slot: usize,
    pub target: TargetId,
    pub width: u32,
    pub height: u32,
}

/// Frame handed out by `grab`; pass `slot` back to `release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabbedFrame {
    pub slot: usize,
    pub frame: OutputFrame,
}

pub struct FrameDownloadPipeline {
    contexts: Vec<DownloadContext>,
    next: usize,
    sequence: u64,
    delivered: u64,
    dropped: u64,
}

impl FrameDownloadPipeline {
    /// Allocate `pool_size` contexts of `width` x `height`
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        pool_size: usize,
        width: u32,
        height: u32,
    ) -> Result<Self, GpuError> {
        let mut pipeline = Self {
            contexts: Vec::with_capacity(pool_size.max(1)),
            next: 0,
            sequence: 0,
            delivered: 0,
            dropped: 0,
        };
        for _ in 0..pool_size.max(1) {
            let target = backend.create_render_target(width, height)?;
            let staging = match backend.create_staging_buffer(width as usize * height as usize * 4) {
                Ok(s) => s,
                Err(e) => {
                    backend.destroy_render_target(target);
                    pipeline.release(backend);
                    return Err(e);
                }
            };
            pipeline.contexts.push(DownloadContext {
                target,
                staging,
                width,
                height,
                state: ContextState::Available,
                kind: OutputKind::View,
                sequence: 0,
                data: Vec::new(),
            });
        }
        Ok(pipeline)
    }

    /// Reserve the next context for a `width` x `height` output.
    ///
    /// Returns `None` without blocking when that context is still in
    /// flight; the request is counted as dropped.
    pub fn create_task(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        kind: OutputKind,
    ) -> Result<Option<DownloadTask>, GpuError> {
        let slot = self.next;
        let ctx = &mut self.contexts[slot];
        if ctx.state != ContextState::Available {
            self.dropped += 1;
            return Ok(None);
        }
        if ctx.width != width || ctx.height != height {
            backend.resize_render_target(ctx.target, width, height)?;
            backend.resize_staging_buffer(ctx.staging, width as usize * height as usize * 4)?;
            ctx.width = width;
            ctx.height = height;
        }
        ctx.kind = kind;
        let target = ctx.target;
        self.next = (self.next + 1) % self.contexts.len();
        Ok(Some(DownloadTask {
            slot,
            target,
            width,
            height,
        }))
    }

    /// Start the copy of a rendered task
    pub fn submit(&mut self, backend: &mut dyn GraphicsBackend, task: DownloadTask) -> Result<(), GpuError> {
        let ctx = &mut self.contexts[task.slot];
        backend.read_render_target(ctx.target, ctx.staging)?;
        self.sequence += 1;
        ctx.sequence = self.sequence;
        ctx.state = ContextState::Pending;
        Ok(())
    }

    /// Oldest finished download, if its copy has landed
    pub fn grab(&mut self, backend: &mut dyn GraphicsBackend) -> Result<Option<GrabbedFrame>, GpuError> {
        let oldest = self
            .contexts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state == ContextState::Pending)
            .min_by_key(|(_, c)| c.sequence)
            .map(|(i, _)| i);
        let Some(slot) = oldest else {
            return Ok(None);
        };

        let ctx = &mut self.contexts[slot];
        if !backend.map_staging(ctx.staging, &mut ctx.data)? {
            return Ok(None);
        }
        ctx.state = ContextState::Ready;
        self.delivered += 1;
        Ok(Some(GrabbedFrame {
            slot,
            frame: OutputFrame {
                width: ctx.width,
                height: ctx.height,
                data: Bytes::from(std::mem::take(&mut ctx.data)),
                kind: ctx.kind,
            },
        }))
    }

    /// Return a grabbed context to the pool
    pub fn release_frame(&mut self, slot: usize) {
        if let Some(ctx) = self.contexts.get_mut(slot) {
            if ctx.state == ContextState::Ready {
                ctx.state = ContextState::Available;
            }
        }
    }

    /// Contexts with a copy in flight
    pub fn in_flight(&self) -> usize {
        self.contexts
            .iter()
            .filter(|c| c.state == ContextState::Pending)
            .count()
    }

    pub fn pool_size(&self) -> usize {
        self.contexts.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Destroy every context
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for ctx in self.contexts.drain(..) {
            backend.destroy_render_target(ctx.target);
            backend.destroy_staging_buffer(ctx.staging);
        }
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn render_solid(backend: &mut dyn GraphicsBackend, task: &DownloadTask, value: f32) {
        backend.bind_render_target(Some(task.target)).unwrap();
        backend.clear([value, 0.0, 0.0, 1.0]).unwrap();
    }

    #[test]
    fn test_create_grab_release_cycle() {
        let mut backend = SoftwareBackend::new().with_readback_latency(1);
        let mut pipeline = FrameDownloadPipeline::new(&mut backend, 2, 4, 4).unwrap();

        let task = pipeline
            .create_task(&mut backend, 4, 4, OutputKind::View)
            .unwrap()
            .unwrap();
        render_solid(&mut backend, &task, 1.0);
        pipeline.submit(&mut backend, task).unwrap();
        assert_eq!(pipeline.in_flight(), 1);

        // First poll is still in flight
        assert!(pipeline.grab(&mut backend).unwrap().is_none());
        let grabbed = pipeline.grab(&mut backend).unwrap().unwrap();
        assert_eq!(grabbed.frame.width, 4);
        assert_eq!(grabbed.frame.data.len(), 64);
        assert_eq!(&grabbed.frame.data[..4], &[255, 0, 0, 255]);
        assert_eq!(pipeline.in_flight(), 0);
        pipeline.release_frame(grabbed.slot);
        assert_eq!(pipeline.delivered(), 1);
    }

    #[test]
    fn test_full_pool_drops_without_blocking() {
        let mut backend = SoftwareBackend::new().with_readback_latency(100);
        let mut pipeline = FrameDownloadPipeline::new(&mut backend, 2, 2, 2).unwrap();
        for _ in 0..2 {
            let task = pipeline
                .create_task(&mut backend, 2, 2, OutputKind::View)
                .unwrap()
                .unwrap();
            pipeline.submit(&mut backend, task).unwrap();
        }
        assert!(pipeline
            .create_task(&mut backend, 2, 2, OutputKind::View)
            .unwrap()
            .is_none());
        assert_eq!(pipeline.dropped(), 1);
    }

    #[test]
    fn test_task_resizes_context_and_keeps_order() {
        let mut backend = SoftwareBackend::new();
        let mut pipeline = FrameDownloadPipeline::new(&mut backend, 3, 2, 2).unwrap();

        let first = pipeline
            .create_task(&mut backend, 8, 4, OutputKind::Snapshot)
            .unwrap()
            .unwrap();
        render_solid(&mut backend, &first, 0.0);
        pipeline.submit(&mut backend, first).unwrap();
        let second = pipeline
            .create_task(&mut backend, 2, 2, OutputKind::View)
            .unwrap()
            .unwrap();
        render_solid(&mut backend, &second, 1.0);
        pipeline.submit(&mut backend, second).unwrap();

        let a = pipeline.grab(&mut backend).unwrap().unwrap();
        assert_eq!((a.frame.width, a.frame.height, a.frame.kind), (8, 4, OutputKind::Snapshot));
        assert_eq!(a.frame.data.len(), 8 * 4 * 4);
        let b = pipeline.grab(&mut backend).unwrap().unwrap();
        assert_eq!(b.frame.kind, OutputKind::View);
        pipeline.release_frame(a.slot);
        pipeline.release_frame(b.slot);
    }
}
