//! Public control surface
//!
//! Every call is cheap and thread-safe: setters write the pending
//! parameters, frames go into the camera's ring buffer, and requests are
//! queued for the scheduler thread. Only [`StitchRenderer::init`] and
//! [`StitchRenderer::unproject`] block, and both are bounded.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use glam::{DVec2, DVec3};
use parking_lot::Mutex;

use super::params::{ParameterManager, RenderParameters};
use super::scheduler::{Command, OutputCallback, OutputMode, Scheduler, Shared, UnprojectSlot};
use super::state::RenderState;
use crate::error::{RecoverableError, RenderError};
use crate::frame::{FrameRingBuffer, FrameView};
use crate::gpu::{BackendFactory, Viewport};
use crate::pipeline::OutputFrame;
use crate::projection::{CalibrationProfile, PanoType};
use crate::settings::StitcherSettings;
use crate::telemetry::RenderStats;
use crate::view::{Unprojected, ViewCamera, ViewDof};

/// Longest single wait on the un-projection condition before re-checking state
const UNPROJECT_POLL: Duration = Duration::from_millis(20);

pub struct StitchRenderer {
    shared: Arc<Shared>,
    profile: Arc<CalibrationProfile>,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    unproject_gate: Mutex<()>,
    unproject_timeout: Duration,
}

impl StitchRenderer {
    /// Load `profile` and start the scheduler thread (state `Created`)
    pub fn new(profile: CalibrationProfile, settings: &StitcherSettings) -> Result<Self, RenderError> {
        let settings = settings.validated();
        let profile = Arc::new(profile);

        let rings = (0..profile.camera_count())
            .map(|_| FrameRingBuffer::new(settings.ring_buffer_config()))
            .collect();
        let params = ParameterManager::new(
            profile.clone(),
            RenderParameters::new(settings.pano_type, settings.draw_region()),
        );
        let shared = Arc::new(Shared::new(params, rings, settings.target_fps));

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let thread = Scheduler::spawn(shared.clone(), profile.clone(), &settings, command_rx).map_err(|e| {
            tracing::error!("Failed to spawn render thread: {}", e);
            RenderError::Failed
        })?;
        shared.state.transition(RenderState::Created);
        tracing::info!(
            "Stitch renderer created: {} cameras, {} layouts",
            profile.camera_count(),
            profile.layouts().len()
        );

        Ok(Self {
            shared,
            profile,
            commands,
            thread: Some(thread),
            unproject_gate: Mutex::new(()),
            unproject_timeout: Duration::from_millis(settings.unproject_timeout_ms),
        })
    }

    /// Create the graphics context on the scheduler thread and wait for it
    pub fn init(&self, factory: BackendFactory) -> Result<(), RenderError> {
        match self.state() {
            RenderState::Created => {}
            RenderState::Error => return Err(RenderError::Failed),
            other => return Err(RenderError::InvalidState(other)),
        }
        let (ack, ack_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Init { factory, ack })
            .map_err(|_| RenderError::Failed)?;
        match ack_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RenderError::Graphics(e)),
            Err(_) => Err(RenderError::Failed),
        }
    }

    pub fn state(&self) -> RenderState {
        self.shared.state.get()
    }

    fn ensure_alive(&self) -> Result<(), RenderError> {
        match self.state() {
            RenderState::Error => Err(RenderError::Failed),
            RenderState::UnCreated => Err(RenderError::InvalidState(RenderState::UnCreated)),
            _ => Ok(()),
        }
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    pub fn camera_count(&self) -> usize {
        self.shared.rings.len()
    }

    /// Set the view DOF; zoom is clamped and flat views kept on the canvas
    pub fn set_view(&self, view: ViewDof) -> Result<(), RenderError> {
        self.ensure_alive()?;
        self.shared.params.lock().set_view(view);
        Ok(())
    }

    /// Current (applied) view DOF
    pub fn view(&self) -> ViewDof {
        self.shared.params.lock().current().view
    }

    pub fn set_pano_type(&self, pano_type: PanoType) -> Result<(), RenderError> {
        self.ensure_alive()?;
        if !self.profile.supports(pano_type) {
            tracing::warn!("Ignoring unsupported pano type {}", pano_type);
            return Err(RecoverableError::UnsupportedPanoType(pano_type.name().to_string()).into());
        }
        self.shared.params.lock().set_pano_type(pano_type);
        Ok(())
    }

    /// Current (applied) pano type
    pub fn pano_type(&self) -> PanoType {
        self.shared.params.lock().current().pano_type
    }

    /// Output pixels the view is drawn into
    pub fn set_draw_region(&self, region: Viewport) -> Result<(), RenderError> {
        self.ensure_alive()?;
        if region.width == 0 || region.height == 0 {
            return Err(RecoverableError::InvalidParameter(format!(
                "draw region {}x{} is empty",
                region.width, region.height
            ))
            .into());
        }
        self.shared.params.lock().set_draw_region(region);
        Ok(())
    }

    /// Copy a decoded frame into `camera`'s ring buffer
    pub fn submit_frame(&self, camera: usize, frame: &FrameView<'_>) -> Result<(), RenderError> {
        self.ensure_alive()?;
        let ring = self
            .shared
            .rings
            .get(camera)
            .ok_or(RecoverableError::UnknownCamera(camera))?;
        ring.push_frame(frame)?;
        Ok(())
    }

    /// Ring buffer for producers writing in place
    pub fn ring_buffer(&self, camera: usize) -> Option<&FrameRingBuffer> {
        self.shared.rings.get(camera)
    }

    /// Queue a full panorama at native resolution.
    ///
    /// The frame arrives on the returned receiver once a scene exists and
    /// every camera has delivered a frame; the sender is dropped if the
    /// render object stops first.
    pub fn request_snapshot(&self) -> Result<Receiver<OutputFrame>, RenderError> {
        self.ensure_alive()?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.shared.outputs.lock().snapshots.push_back(tx);
        Ok(rx)
    }

    /// Register the view output callback, replacing any previous one.
    ///
    /// The callback runs on the render thread.
    pub fn set_output_callback<F>(&self, mode: OutputMode, callback: F) -> Result<(), RenderError>
    where
        F: FnMut(&OutputFrame) + Send + 'static,
    {
        self.ensure_alive()?;
        if mode == (OutputMode::Periodic { every: 0 }) {
            return Err(RecoverableError::InvalidParameter("output period of 0 ticks".into()).into());
        }
        let mut outputs = self.shared.outputs.lock();
        outputs.callback = Some(OutputCallback {
            callback: Box::new(callback),
            mode,
        });
        outputs.generation += 1;
        Ok(())
    }

    pub fn clear_output_callback(&self) {
        let mut outputs = self.shared.outputs.lock();
        outputs.callback = None;
        outputs.generation += 1;
    }

    /// Map normalised draw-region points (origin top-left) to the panorama.
    ///
    /// Blocks until the render thread services the request on its next tick.
    /// Points that miss the surface, or every point while no scene exists,
    /// come back as `None`.
    pub fn unproject(&self, points: &[DVec2]) -> Result<Vec<Option<Unprojected>>, RenderError> {
        match self.state() {
            RenderState::Inited | RenderState::SceneCreated => {}
            RenderState::Error => return Err(RenderError::Failed),
            other => return Err(RenderError::InvalidState(other)),
        }
        let _gate = self.unproject_gate.lock();
        let deadline = Instant::now() + self.unproject_timeout;

        let mut slot = self.shared.unproject.lock();
        *slot = UnprojectSlot::Requested(points.to_vec());
        loop {
            if let UnprojectSlot::Done(_) = &*slot {
                if let UnprojectSlot::Done(results) = std::mem::take(&mut *slot) {
                    return Ok(results);
                }
            }
            let state = self.state();
            if !state.is_inited() {
                *slot = UnprojectSlot::Idle;
                return Err(match state {
                    RenderState::Error => RenderError::Failed,
                    other => RenderError::InvalidState(other),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                *slot = UnprojectSlot::Idle;
                return Err(RenderError::Timeout);
            }
            let wait = (deadline - now).min(UNPROJECT_POLL);
            self.shared.unproject_done.wait_for(&mut slot, wait);
        }
    }

    /// View DOF centring a physical direction in the current layout, keeping
    /// the current zoom. `None` until the input size is known or when the
    /// layout does not show that direction.
    pub fn frame_direction(&self, direction: DVec3) -> Result<Option<ViewDof>, RenderError> {
        self.ensure_alive()?;
        let params = self.shared.params.lock();
        let Some(geometry) = params.current_geometry() else {
            return Ok(None);
        };
        Ok(ViewCamera::frame_direction(&geometry, direction, params.current().view.zoom))
    }

    pub fn stats(&self) -> RenderStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the scheduler after it released every graphics resource
    pub fn destroy(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared
            .destroy_requested
            .store(true, std::sync::atomic::Ordering::Release);
        let _ = self.commands.send(Command::Destroy);
        if thread.join().is_err() {
            tracing::error!("Render thread panicked during shutdown");
            self.shared.state.fail();
        }
        tracing::info!("Stitch renderer destroyed");
    }
}

impl Drop for StitchRenderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::error::GpuError;
    use crate::gpu::{
        FrameUniforms, GraphicsBackend, GraphicsCapabilities, MeshId, ProgramDesc, ProgramId, SoftwareBackend,
        StagingId, TargetId, TextureFormat, TextureId,
    };
    use crate::pipeline::OutputKind;
    use crate::projection::{CameraModel, Intrinsics, LensType, PanoLayout};

    fn profile() -> CalibrationProfile {
        let cameras = [0.0f64, 90.0, 180.0, 270.0]
            .iter()
            .map(|yaw| {
                CameraModel::from_yaw_pitch_roll(LensType::Rectilinear, yaw.to_radians(), 0.0, 0.0).with_intrinsics(
                    32,
                    24,
                    Intrinsics {
                        fx: 9.0,
                        fy: 9.0,
                        cx: 16.0,
                        cy: 12.0,
                    },
                )
            })
            .collect();
        let layouts = vec![PanoLayout::new(PanoType::Cylinder), PanoLayout::new(PanoType::Sphere360)];
        CalibrationProfile::new(cameras, layouts).unwrap()
    }

    fn settings() -> StitcherSettings {
        let mut settings = StitcherSettings::default();
        settings.target_fps = 200;
        settings.draw_width = 64;
        settings.draw_height = 32;
        settings.cylinder_segments.columns = 32;
        settings.cylinder_segments.rows = 4;
        settings.sphere_segments.columns = 32;
        settings.sphere_segments.rows = 16;
        settings
    }

    fn software() -> BackendFactory {
        Box::new(|| Ok(Box::new(SoftwareBackend::new()) as Box<dyn GraphicsBackend>))
    }

    fn feed(renderer: &StitchRenderer) {
        let data = vec![128u8; 32 * 24 * 3];
        for camera in 0..renderer.camera_count() {
            let frame = FrameView::packed(PixelFormat::Rgb24, 32, 24, &data);
            renderer.submit_frame(camera, &frame).unwrap();
        }
    }

    fn wait_for(renderer: &StitchRenderer, state: RenderState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while renderer.state() != state {
            assert!(Instant::now() < deadline, "stuck in {:?}", renderer.state());
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        assert_eq!(renderer.state(), RenderState::Created);
        assert!(matches!(
            renderer.unproject(&[DVec2::splat(0.5)]),
            Err(RenderError::InvalidState(RenderState::Created))
        ));

        renderer.init(software()).unwrap();
        assert!(renderer.state().is_inited());
        assert!(matches!(renderer.init(software()), Err(RenderError::InvalidState(_))));

        feed(&renderer);
        wait_for(&renderer, RenderState::SceneCreated);
        assert_eq!(renderer.stats().scene_builds, 1);

        renderer.destroy();
        assert_eq!(renderer.state(), RenderState::UnCreated);
        assert!(matches!(renderer.set_view(ViewDof::default()), Err(RenderError::InvalidState(_))));
    }

    #[test]
    fn test_failed_init_is_terminal() {
        let renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        let result = renderer.init(Box::new(|| Err(crate::error::GpuError::NoAdapter)));
        assert!(matches!(result, Err(RenderError::Graphics(_))));
        assert_eq!(renderer.state(), RenderState::Error);
        assert!(matches!(renderer.request_snapshot(), Err(RenderError::Failed)));
    }

    #[test]
    fn test_control_surface_validation() {
        let renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        assert!(matches!(
            renderer.set_pano_type(PanoType::Binocular),
            Err(RenderError::Recoverable(RecoverableError::UnsupportedPanoType(_)))
        ));
        assert!(renderer.set_draw_region(Viewport::full(0, 10)).is_err());
        let data = [0u8; 12];
        let frame = FrameView::packed(PixelFormat::Rgb24, 2, 2, &data);
        assert!(matches!(
            renderer.submit_frame(9, &frame),
            Err(RenderError::Recoverable(RecoverableError::UnknownCamera(9)))
        ));
        assert!(renderer
            .set_output_callback(OutputMode::Periodic { every: 0 }, |_| {})
            .is_err());
    }

    #[test]
    fn test_snapshot_and_unproject() {
        let renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        renderer.init(software()).unwrap();
        let snapshot = renderer.request_snapshot().unwrap();
        feed(&renderer);

        let frame = snapshot.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.kind, OutputKind::Snapshot);
        assert_eq!(frame.data.len(), frame.width as usize * frame.height as usize * 4);
        // Four cameras at 32 px with the default crop
        assert!(frame.width > 0 && frame.height > 0);

        let hits = renderer.unproject(&[DVec2::splat(0.5)]).unwrap();
        let hit = hits[0].expect("view centre hits the sphere");
        assert!((hit.uv.x - 0.5).abs() < 1e-6);
        let direction = hit.direction.unwrap();
        assert!(direction.z < -0.9);

        let dof = renderer.frame_direction(DVec3::X).unwrap().unwrap();
        assert!((dof.horizontal - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_periodic_callback() {
        let renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        renderer.init(software()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        renderer
            .set_output_callback(OutputMode::Periodic { every: 1 }, move |frame| {
                let _ = tx.send((frame.width, frame.height, frame.kind));
            })
            .unwrap();
        feed(&renderer);

        for _ in 0..2 {
            let (w, h, kind) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!((w, h, kind), (64, 32, OutputKind::View));
        }
        renderer.clear_output_callback();
    }

    #[test]
    fn test_mixed_formats_pause_output() {
        let renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        renderer.init(software()).unwrap();
        let snapshot = renderer.request_snapshot().unwrap();

        let rgb = vec![128u8; 32 * 24 * 3];
        let yuv = vec![128u8; PixelFormat::Yuv420p.frame_size(32, 24)];
        for camera in 0..3 {
            renderer
                .submit_frame(camera, &FrameView::packed(PixelFormat::Rgb24, 32, 24, &rgb))
                .unwrap();
        }
        renderer
            .submit_frame(3, &FrameView::packed(PixelFormat::Yuv420p, 32, 24, &yuv))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !renderer.stats().mixed_formats {
            assert!(Instant::now() < deadline, "format conflict not reported");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(snapshot.try_recv().is_err());

        renderer
            .submit_frame(3, &FrameView::packed(PixelFormat::Rgb24, 32, 24, &rgb))
            .unwrap();
        let frame = snapshot.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.kind, OutputKind::Snapshot);
        let deadline = Instant::now() + Duration::from_secs(5);
        while renderer.stats().mixed_formats {
            assert!(Instant::now() < deadline, "format conflict not cleared");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[derive(Default)]
    struct Counters {
        meshes_created: AtomicUsize,
        meshes_destroyed: AtomicUsize,
        textures_created: AtomicUsize,
        textures_destroyed: AtomicUsize,
        panic_on_present: AtomicBool,
    }

    /// Software backend that counts resources and can be told to panic
    struct CountingBackend {
        inner: SoftwareBackend,
        counters: Arc<Counters>,
    }

    impl GraphicsBackend for CountingBackend {
        fn capabilities(&self) -> &GraphicsCapabilities {
            self.inner.capabilities()
        }
        fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError> {
            self.inner.create_render_target(width, height)
        }
        fn resize_render_target(&mut self, target: TargetId, width: u32, height: u32) -> Result<(), GpuError> {
            self.inner.resize_render_target(target, width, height)
        }
        fn destroy_render_target(&mut self, target: TargetId) {
            self.inner.destroy_render_target(target)
        }
        fn bind_render_target(&mut self, target: Option<TargetId>) -> Result<(), GpuError> {
            self.inner.bind_render_target(target)
        }
        fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
            self.inner.set_viewport(viewport)
        }
        fn clear(&mut self, color: [f32; 4]) -> Result<(), GpuError> {
            self.inner.clear(color)
        }
        fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError> {
            self.counters.textures_created.fetch_add(1, Ordering::SeqCst);
            self.inner.create_texture(width, height, format)
        }
        fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError> {
            self.inner.write_texture(texture, data)
        }
        fn destroy_texture(&mut self, texture: TextureId) {
            self.counters.textures_destroyed.fetch_add(1, Ordering::SeqCst);
            self.inner.destroy_texture(texture)
        }
        fn compile_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, GpuError> {
            self.inner.compile_program(desc)
        }
        fn destroy_program(&mut self, program: ProgramId) {
            self.inner.destroy_program(program)
        }
        fn create_mesh(&mut self, vertices: &[f32], stride_floats: usize, indices: &[u32]) -> Result<MeshId, GpuError> {
            self.counters.meshes_created.fetch_add(1, Ordering::SeqCst);
            self.inner.create_mesh(vertices, stride_floats, indices)
        }
        fn destroy_mesh(&mut self, mesh: MeshId) {
            self.counters.meshes_destroyed.fetch_add(1, Ordering::SeqCst);
            self.inner.destroy_mesh(mesh)
        }
        fn draw(
            &mut self,
            program: ProgramId,
            mesh: MeshId,
            textures: &[TextureId],
            uniforms: &FrameUniforms,
        ) -> Result<(), GpuError> {
            self.inner.draw(program, mesh, textures, uniforms)
        }
        fn create_staging_buffer(&mut self, size: usize) -> Result<StagingId, GpuError> {
            self.inner.create_staging_buffer(size)
        }
        fn resize_staging_buffer(&mut self, staging: StagingId, size: usize) -> Result<(), GpuError> {
            self.inner.resize_staging_buffer(staging, size)
        }
        fn destroy_staging_buffer(&mut self, staging: StagingId) {
            self.inner.destroy_staging_buffer(staging)
        }
        fn read_render_target(&mut self, target: TargetId, staging: StagingId) -> Result<(), GpuError> {
            self.inner.read_render_target(target, staging)
        }
        fn map_staging(&mut self, staging: StagingId, out: &mut Vec<u8>) -> Result<bool, GpuError> {
            self.inner.map_staging(staging, out)
        }
        fn present(&mut self) -> Result<(), GpuError> {
            if self.counters.panic_on_present.load(Ordering::SeqCst) {
                panic!("present failed");
            }
            self.inner.present()
        }
        fn resize_display(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
            self.inner.resize_display(width, height)
        }
    }

    #[test]
    fn test_panicking_tick_releases_resources() {
        let counters = Arc::new(Counters::default());
        let backend_counters = counters.clone();
        let mut renderer = StitchRenderer::new(profile(), &settings()).unwrap();
        renderer
            .init(Box::new(move || {
                Ok(Box::new(CountingBackend {
                    inner: SoftwareBackend::new(),
                    counters: backend_counters,
                }) as Box<dyn GraphicsBackend>)
            }))
            .unwrap();
        feed(&renderer);
        wait_for(&renderer, RenderState::SceneCreated);

        // Scene meshes are uploaded on the first draw after creation
        let deadline = Instant::now() + Duration::from_secs(5);
        while counters.meshes_created.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "scene was never drawn");
            std::thread::sleep(Duration::from_millis(2));
        }

        counters.panic_on_present.store(true, Ordering::SeqCst);
        wait_for(&renderer, RenderState::Error);
        renderer.destroy();

        assert_eq!(renderer.state(), RenderState::Error);
        assert_eq!(
            counters.meshes_destroyed.load(Ordering::SeqCst),
            counters.meshes_created.load(Ordering::SeqCst)
        );
        assert!(counters.textures_created.load(Ordering::SeqCst) > 0);
        assert_eq!(
            counters.textures_destroyed.load(Ordering::SeqCst),
            counters.textures_created.load(Ordering::SeqCst)
        );
    }
}
