//! Render scheduler thread
//!
//! Owns the graphics backend for its whole lifetime; no backend call happens
//! anywhere else. Each tick uploads at most one frame per camera, applies the
//! pending parameters, runs the resulting tasks in mask order, collects
//! finished downloads and then sleeps on the command channel until the next
//! tick is due.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use glam::DVec2;
use parking_lot::{Condvar, Mutex};

use super::params::{ParameterManager, RenderParameters};
use super::state::{AtomicRenderState, RenderState};
use super::tasks::TaskMask;
use crate::error::{FatalFault, GpuError, RecoverableError};
use crate::frame::{FrameRingBuffer, PixelFormat};
use crate::gpu::{BackendFactory, FrameUniforms, GraphicsBackend, Viewport};
use crate::pipeline::{FrameDownloadPipeline, OutputFrame, OutputKind, TextureUploadPipeline};
use crate::projection::CalibrationProfile;
use crate::scene::{RenderScene, SceneConfig};
use crate::settings::StitcherSettings;
use crate::telemetry::{FrameProfiler, RenderStats};
use crate::view::{unproject_batch, Unprojected, ViewCamera, ViewMatrices};

/// How often tick statistics are logged
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// When the registered output callback receives frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The next rendered view, then the callback is dropped
    OneShot,
    /// A view every `every` ticks
    Periodic { every: u32 },
}

pub(super) type OutputCallbackFn = Box<dyn FnMut(&OutputFrame) + Send>;

pub(super) struct OutputCallback {
    pub callback: OutputCallbackFn,
    pub mode: OutputMode,
}

/// Output requests waiting for the scheduler
#[derive(Default)]
pub(super) struct OutputRequests {
    pub snapshots: VecDeque<Sender<OutputFrame>>,
    pub callback: Option<OutputCallback>,
    /// Bumped whenever the callback is replaced or cleared
    pub generation: u64,
}

/// Cross-thread un-projection request/result pair
#[derive(Debug, Default)]
pub(super) enum UnprojectSlot {
    #[default]
    Idle,
    Requested(Vec<DVec2>),
    Done(Vec<Option<Unprojected>>),
}

pub(super) enum Command {
    Init {
        factory: BackendFactory,
        ack: Sender<Result<(), GpuError>>,
    },
    Destroy,
}

/// State shared between the control surface and the scheduler thread
pub(super) struct Shared {
    pub state: AtomicRenderState,
    pub params: Mutex<ParameterManager>,
    pub rings: Vec<FrameRingBuffer>,
    pub unproject: Mutex<UnprojectSlot>,
    pub unproject_done: Condvar,
    pub outputs: Mutex<OutputRequests>,
    pub stats: Mutex<RenderStats>,
    pub destroy_requested: AtomicBool,
}

impl Shared {
    pub fn new(params: ParameterManager, rings: Vec<FrameRingBuffer>, target_fps: u32) -> Self {
        Self {
            state: AtomicRenderState::new(RenderState::UnCreated),
            params: Mutex::new(params),
            rings,
            unproject: Mutex::new(UnprojectSlot::Idle),
            unproject_done: Condvar::new(),
            outputs: Mutex::new(OutputRequests::default()),
            stats: Mutex::new(RenderStats {
                target_fps,
                ..Default::default()
            }),
            destroy_requested: AtomicBool::new(false),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(super) struct Scheduler {
    shared: Arc<Shared>,
    profile: Arc<CalibrationProfile>,
    scene_config: SceneConfig,
    download_pool_size: usize,
    output_scale: f64,
    clear_color: [f32; 4],
    frame_interval: Duration,

    backend: Option<Box<dyn GraphicsBackend>>,
    scene: Option<RenderScene>,
    uploads: Option<TextureUploadPipeline>,
    downloads: Option<FrameDownloadPipeline>,
    scratch: Vec<u8>,
    viewport: Viewport,
    output_size: (u32, u32),
    snapshots_in_flight: VecDeque<Sender<OutputFrame>>,
    one_shot_generation: Option<u64>,
    format_conflict: Option<(PixelFormat, PixelFormat)>,

    profiler: FrameProfiler,
    ticks: u64,
    scene_builds: u64,
    frames_delivered: u64,
    last_stats_log: Instant,
}

impl Scheduler {
    /// Start the scheduler thread; it idles until an `Init` command arrives
    pub fn spawn(
        shared: Arc<Shared>,
        profile: Arc<CalibrationProfile>,
        settings: &StitcherSettings,
        commands: Receiver<Command>,
    ) -> std::io::Result<JoinHandle<()>> {
        let scheduler = Scheduler {
            shared,
            profile,
            scene_config: settings.scene_config(),
            download_pool_size: settings.download_pool_size,
            output_scale: settings.output_scale,
            clear_color: settings.clear_color.rgba(),
            frame_interval: Duration::from_secs_f64(1.0 / f64::from(settings.target_fps.max(1))),
            backend: None,
            scene: None,
            uploads: None,
            downloads: None,
            scratch: Vec::new(),
            viewport: settings.draw_region(),
            output_size: (settings.draw_width, settings.draw_height),
            snapshots_in_flight: VecDeque::new(),
            one_shot_generation: None,
            format_conflict: None,
            profiler: FrameProfiler::new(),
            ticks: 0,
            scene_builds: 0,
            frames_delivered: 0,
            last_stats_log: Instant::now(),
        };
        thread::Builder::new()
            .name("pano-render".into())
            .spawn(move || scheduler.run(commands))
    }

    fn run(mut self, commands: Receiver<Command>) {
        tracing::info!("Render scheduler started");
        if !self.wait_for_init(&commands) {
            self.finish();
            return;
        }

        loop {
            let start = self.profiler.begin_tick();
            match self.tick() {
                Ok(true) => {}
                Ok(false) => break,
                Err(fault) => {
                    self.fail(fault);
                    break;
                }
            }
            let elapsed = self.profiler.end_tick(start);
            self.publish_stats();

            match commands.recv_timeout(self.frame_interval.saturating_sub(elapsed)) {
                Ok(Command::Destroy) | Err(RecvTimeoutError::Disconnected) => {
                    self.shared.destroy_requested.store(true, Ordering::Release);
                }
                Ok(Command::Init { ack, .. }) => {
                    tracing::warn!("Render object already initialised");
                    let _ = ack.send(Ok(()));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.finish();
    }

    /// Block until the graphics context is created; false when shutting down
    fn wait_for_init(&mut self, commands: &Receiver<Command>) -> bool {
        loop {
            let (factory, ack) = match commands.recv() {
                Ok(Command::Init { factory, ack }) => (factory, ack),
                Ok(Command::Destroy) | Err(_) => return false,
            };
            if self.shared.destroy_requested.load(Ordering::Acquire) {
                let _ = ack.send(Err(GpuError::ContextLost("render object destroyed".into())));
                return false;
            }

            let created = panic::catch_unwind(AssertUnwindSafe(|| self.create_context(factory)));
            let result = match created {
                Ok(result) => result,
                Err(payload) => Err(GpuError::ContextLost(panic_message(payload.as_ref()))),
            };
            match result {
                Ok(()) => {
                    self.shared.state.transition(RenderState::Inited);
                    let _ = ack.send(Ok(()));
                    return true;
                }
                Err(e) => {
                    self.fail(FatalFault::Gpu(e.clone()));
                    let _ = ack.send(Err(e));
                    return false;
                }
            }
        }
    }

    fn create_context(&mut self, factory: BackendFactory) -> Result<(), GpuError> {
        let mut backend = factory()?;
        let caps = backend.capabilities().clone();
        tracing::info!(
            "Graphics context: {} (max texture {}, max cameras per program {}, rg8 {})",
            caps.backend,
            caps.max_texture_dimension,
            caps.max_cameras_per_program,
            caps.supports_rg8
        );
        let (w, h) = self.output_size;
        let downloads = FrameDownloadPipeline::new(backend.as_mut(), self.download_pool_size, w.max(1), h.max(1))?;
        self.uploads = Some(TextureUploadPipeline::new(self.profile.camera_count(), &caps));
        self.downloads = Some(downloads);
        self.backend = Some(backend);
        Ok(())
    }

    /// One scheduler tick; false once the loop should stop.
    ///
    /// The backend stays owned outside the unwind boundary so a panicking
    /// task still leaves it available to release every resource.
    fn tick(&mut self) -> Result<bool, FatalFault> {
        let Some(mut backend) = self.backend.take() else {
            return Ok(false);
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_tasks(backend.as_mut())));
        self.backend = Some(backend);
        match outcome {
            Ok(result) => result,
            Err(payload) => Err(FatalFault::Panic(panic_message(payload.as_ref()))),
        }
    }

    fn run_tasks(&mut self, backend: &mut dyn GraphicsBackend) -> Result<bool, FatalFault> {
        self.ticks += 1;
        self.upload_frames(backend)?;

        let (flags, params) = {
            let mut manager = self.shared.params.lock();
            let flags = manager.apply();
            (flags, *manager.current())
        };

        let mut mask = flags.tasks(params.has_input());
        if self.shared.destroy_requested.load(Ordering::Acquire) {
            mask |= TaskMask::DESTROY;
        }
        if matches!(*self.shared.unproject.lock(), UnprojectSlot::Requested(_)) {
            mask |= TaskMask::UNPROJECT;
        }
        if self.output_wanted() {
            mask |= TaskMask::DOWNLOAD;
        }
        if mask != TaskMask::RENDER {
            tracing::trace!("Tick {}: {:?}", self.ticks, mask);
        }

        if mask.contains(TaskMask::DESTROY) {
            tracing::info!("Render object destroy requested");
            self.release_resources(backend);
            return Ok(false);
        }
        if mask.contains(TaskMask::CREATE_SCENE) {
            self.create_scene(backend, &params)?;
        }
        if mask.contains(TaskMask::SET_VIEWPORT) {
            self.set_viewport(backend, &params)?;
        }
        if mask.contains(TaskMask::SET_OUTPUT_SIZE) {
            self.set_output_size(backend, &params);
        }
        if mask.contains(TaskMask::UNPROJECT) {
            self.service_unproject(&params);
        }
        if mask.contains(TaskMask::RENDER) {
            self.render(backend, &params)?;
        }
        if mask.contains(TaskMask::DOWNLOAD) {
            self.download(backend, &params)?;
        }
        self.collect_downloads(backend)?;
        Ok(true)
    }

    /// Consume at most one frame per camera
    fn upload_frames(&mut self, backend: &mut dyn GraphicsBackend) -> Result<(), FatalFault> {
        let Some(uploads) = self.uploads.as_mut() else {
            return Ok(());
        };
        let mut newest = None;
        for (camera, ring) in self.shared.rings.iter().enumerate() {
            let Some(header) = ring.grab_frame() else {
                continue;
            };
            // The ring lock is only held for the copy
            let copied = match ring.out_map_frame() {
                Some(data) => {
                    self.scratch.clear();
                    self.scratch.extend_from_slice(&data);
                    true
                }
                None => false,
            };
            ring.release_frame();
            if copied {
                uploads.upload(backend, camera, &header, &self.scratch)?;
                newest = Some((header.width, header.height));
            }
        }

        let conflict = uploads.format_conflict();
        if conflict != self.format_conflict {
            match conflict {
                Some((a, b)) => tracing::warn!(
                    "Cameras deliver mixed pixel formats ({} and {}), rendering paused",
                    a.display_name(),
                    b.display_name()
                ),
                None => tracing::info!("Camera pixel formats agree, rendering resumed"),
            }
            self.format_conflict = conflict;
        }

        if let Some((width, height)) = newest {
            let mut manager = self.shared.params.lock();
            let pending = manager.pending();
            if (pending.input_width, pending.input_height) != (width, height) {
                tracing::info!("Input resolution {}x{}", width, height);
                manager.set_input_size(width, height);
            }
        }
        Ok(())
    }

    fn create_scene(&mut self, backend: &mut dyn GraphicsBackend, params: &RenderParameters) -> Result<(), FatalFault> {
        if let Some(mut old) = self.scene.take() {
            old.release(backend);
        }
        let caps = backend.capabilities().clone();
        match RenderScene::create(
            &self.profile,
            params.pano_type,
            params.input_width,
            params.input_height,
            &self.scene_config,
            &caps,
        ) {
            Ok(scene) => {
                self.scene = Some(scene);
                self.scene_builds += 1;
                // Callers observing SceneCreated must see the build counted
                self.publish_stats();
                self.shared.state.transition(RenderState::SceneCreated);
                Ok(())
            }
            Err(e @ (RecoverableError::UnknownResolution { .. } | RecoverableError::UnsupportedPanoType(_))) => {
                tracing::error!("No scene for {} at {}x{}: {}", params.pano_type, params.input_width, params.input_height, e);
                self.shared.state.transition(RenderState::Inited);
                Ok(())
            }
            Err(e) => Err(FatalFault::Scene(e.to_string())),
        }
    }

    fn set_viewport(&mut self, backend: &mut dyn GraphicsBackend, params: &RenderParameters) -> Result<(), FatalFault> {
        let max = backend.capabilities().max_texture_dimension;
        let region = params.draw_region;
        let right = region.x.saturating_add(region.width).min(max);
        let bottom = region.y.saturating_add(region.height).min(max);
        if region.width == 0 || region.height == 0 || right <= region.x || bottom <= region.y {
            tracing::warn!("Ignoring empty draw region {:?}", region);
            return Ok(());
        }
        backend.resize_display(right, bottom)?;
        self.viewport = Viewport {
            x: region.x,
            y: region.y,
            width: right - region.x,
            height: bottom - region.y,
        };
        tracing::debug!("Viewport {:?}", self.viewport);
        Ok(())
    }

    fn set_output_size(&mut self, backend: &mut dyn GraphicsBackend, params: &RenderParameters) {
        let max = f64::from(backend.capabilities().max_texture_dimension.max(1));
        let scale = |v: u32| (f64::from(v) * self.output_scale).round().clamp(1.0, max) as u32;
        self.output_size = (scale(params.draw_region.width), scale(params.draw_region.height));
        tracing::debug!("Output size {}x{}", self.output_size.0, self.output_size.1);
    }

    fn view_matrices(&self, params: &RenderParameters, aspect: f64) -> Option<ViewMatrices> {
        let geometry = self.scene.as_ref()?.geometry();
        let camera = ViewCamera::for_geometry(geometry, params.view.zoom);
        Some(camera.matrices(&params.view, geometry, aspect))
    }

    fn service_unproject(&mut self, params: &RenderParameters) {
        let matrices = self.view_matrices(params, f64::from(self.viewport.aspect()));
        let mut slot = self.shared.unproject.lock();
        if let UnprojectSlot::Requested(points) = &*slot {
            let results = match (self.scene.as_ref(), matrices) {
                (Some(scene), Some(matrices)) => unproject_batch(&matrices, scene.geometry(), points),
                _ => vec![None; points.len()],
            };
            *slot = UnprojectSlot::Done(results);
            self.shared.unproject_done.notify_all();
        }
    }

    /// Scene exists and every camera has textures
    fn ready(&self) -> bool {
        self.scene.is_some() && self.uploads.as_ref().is_some_and(|u| u.all_uploaded())
    }

    /// Draw the scene into the bound target, preparing it first if needed
    fn draw_scene(&mut self, backend: &mut dyn GraphicsBackend, uniforms: &FrameUniforms) -> Result<(), FatalFault> {
        let (Some(scene), Some(uploads)) = (self.scene.as_mut(), self.uploads.as_ref()) else {
            return Ok(());
        };
        let Some(format) = uploads.sampled_format() else {
            return Ok(());
        };
        scene.prepare(backend, format)?;
        scene.render(backend, uploads.textures(), uniforms)?;
        Ok(())
    }

    fn render(&mut self, backend: &mut dyn GraphicsBackend, params: &RenderParameters) -> Result<(), FatalFault> {
        backend.bind_render_target(None)?;
        backend.set_viewport(self.viewport)?;
        backend.clear(self.clear_color)?;
        if self.ready() {
            if let Some(matrices) = self.view_matrices(params, f64::from(self.viewport.aspect())) {
                self.draw_scene(backend, &FrameUniforms::view(matrices.uniform()))?;
            }
        }
        backend.present()?;
        Ok(())
    }

    fn view_output_due(&self, outputs: &OutputRequests) -> bool {
        match outputs.callback.as_ref().map(|c| c.mode) {
            Some(OutputMode::OneShot) => self.one_shot_generation != Some(outputs.generation),
            Some(OutputMode::Periodic { every }) => self.ticks % u64::from(every.max(1)) == 0,
            None => false,
        }
    }

    fn output_wanted(&self) -> bool {
        if !self.ready() {
            return false;
        }
        let outputs = self.shared.outputs.lock();
        !outputs.snapshots.is_empty() || self.view_output_due(&outputs)
    }

    fn download(&mut self, backend: &mut dyn GraphicsBackend, params: &RenderParameters) -> Result<(), FatalFault> {
        let (snapshot, view_due, generation) = {
            let mut outputs = self.shared.outputs.lock();
            let due = self.view_output_due(&outputs);
            (outputs.snapshots.pop_front(), due, outputs.generation)
        };

        if let Some(sender) = snapshot {
            let caps = backend.capabilities().clone();
            let (width, height) = match self.scene.as_ref() {
                Some(scene) => scene.native_size(&caps),
                None => return Ok(()),
            };
            match self.begin_download(backend, width, height, OutputKind::Snapshot)? {
                Some(task) => {
                    self.draw_scene(backend, &FrameUniforms::unwrapped())?;
                    self.finish_download(backend, task)?;
                    self.snapshots_in_flight.push_back(sender);
                }
                // Pool busy, retry next tick
                None => self.shared.outputs.lock().snapshots.push_front(sender),
            }
        }

        if view_due {
            let (width, height) = self.output_size;
            let aspect = f64::from(width) / f64::from(height.max(1));
            if let Some(matrices) = self.view_matrices(params, aspect) {
                if let Some(task) = self.begin_download(backend, width, height, OutputKind::View)? {
                    self.draw_scene(backend, &FrameUniforms::view(matrices.uniform()))?;
                    self.finish_download(backend, task)?;
                    self.one_shot_generation = Some(generation);
                }
            }
        }
        Ok(())
    }

    fn begin_download(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        kind: OutputKind,
    ) -> Result<Option<crate::pipeline::DownloadTask>, FatalFault> {
        let Some(downloads) = self.downloads.as_mut() else {
            return Ok(None);
        };
        let Some(task) = downloads.create_task(backend, width, height, kind)? else {
            tracing::debug!("Download pool busy, {:?} output deferred", kind);
            return Ok(None);
        };
        backend.bind_render_target(Some(task.target))?;
        backend.set_viewport(Viewport::full(width, height))?;
        backend.clear([0.0; 4])?;
        Ok(Some(task))
    }

    fn finish_download(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        task: crate::pipeline::DownloadTask,
    ) -> Result<(), FatalFault> {
        if let Some(downloads) = self.downloads.as_mut() {
            downloads.submit(backend, task)?;
        }
        Ok(())
    }

    /// Hand every landed download to its receiver
    fn collect_downloads(&mut self, backend: &mut dyn GraphicsBackend) -> Result<(), FatalFault> {
        loop {
            let Some(downloads) = self.downloads.as_mut() else {
                return Ok(());
            };
            let Some(grabbed) = downloads.grab(backend)? else {
                return Ok(());
            };
            downloads.release_frame(grabbed.slot);
            let frame = grabbed.frame;
            match frame.kind {
                OutputKind::Snapshot => {
                    if let Some(sender) = self.snapshots_in_flight.pop_front() {
                        if sender.send(frame).is_ok() {
                            self.frames_delivered += 1;
                        }
                    }
                }
                OutputKind::View => self.deliver_view(&frame),
            }
        }
    }

    /// Run the output callback outside the request lock so it may re-register
    fn deliver_view(&mut self, frame: &OutputFrame) {
        let taken = {
            let mut outputs = self.shared.outputs.lock();
            let generation = outputs.generation;
            outputs.callback.take().map(|c| (c, generation))
        };
        let Some((mut output, generation)) = taken else {
            return;
        };
        (output.callback)(frame);
        self.frames_delivered += 1;
        if output.mode == OutputMode::OneShot {
            return;
        }
        let mut outputs = self.shared.outputs.lock();
        if outputs.callback.is_none() && outputs.generation == generation {
            outputs.callback = Some(output);
        }
    }

    fn publish_stats(&mut self) {
        let frame_stats = self.profiler.stats();
        let fps = self.profiler.fps();
        let ring_buffers = self.shared.rings.iter().map(|r| r.stats()).collect();
        {
            let mut stats = self.shared.stats.lock();
            stats.frame_stats = frame_stats.clone();
            stats.fps = fps;
            stats.ticks = self.ticks;
            stats.scene_builds = self.scene_builds;
            stats.patch_count = self.scene.as_ref().map_or(0, |s| s.patches().len());
            stats.frames_uploaded = self.uploads.as_ref().map_or(0, |u| u.uploads());
            stats.frames_delivered = self.frames_delivered;
            stats.mixed_formats = self.format_conflict.is_some();
            stats.ring_buffers = ring_buffers;
        }

        if self.last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
            self.last_stats_log = Instant::now();
            tracing::debug!(
                "Render: {:.1} fps, tick avg {:.2}ms p95 {:.2}ms max {:.2}ms",
                fps,
                frame_stats.avg_ms,
                frame_stats.p95_ms,
                frame_stats.max_ms
            );
        }
    }

    fn release_resources(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(mut scene) = self.scene.take() {
            scene.release(backend);
        }
        if let Some(mut uploads) = self.uploads.take() {
            uploads.release(backend);
        }
        if let Some(mut downloads) = self.downloads.take() {
            downloads.release(backend);
        }
    }

    /// Pin the terminal state and drop everything
    fn fail(&mut self, fault: FatalFault) {
        tracing::error!("Render object failed: {}", fault);
        self.shared.state.fail();
        if let Some(mut backend) = self.backend.take() {
            self.release_resources(backend.as_mut());
        }
        self.scene = None;
        self.uploads = None;
        self.downloads = None;
        // A fault between grab and release must not leave a frame pinned
        for ring in &self.shared.rings {
            ring.reserve_frame();
        }
    }

    fn finish(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            self.release_resources(backend.as_mut());
        }
        self.snapshots_in_flight.clear();
        self.shared.outputs.lock().snapshots.clear();
        if self.shared.state.get() != RenderState::Error {
            self.shared.state.transition(RenderState::UnCreated);
        }
        // Wake un-projection callers so they observe the new state
        let _guard = self.shared.unproject.lock();
        self.shared.unproject_done.notify_all();
        tracing::info!("Render scheduler stopped after {} ticks", self.ticks);
    }
}
