//! Pano Stitcher - demo entry point
//!
//! Feeds solid-colour frames from every camera of a calibration profile
//! through the stitcher, then writes a native-resolution snapshot as PNG.
//!
//! ```text
//! pano-stitcher [--profile FILE.json] [--settings FILE.xml] [--pano NAME]
//!               [--backend software|wgpu] [--ticks N] [--out FILE.png]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use pano_stitcher::gpu::{BackendFactory, GraphicsBackend, SoftwareBackend, WgpuBackend};
use pano_stitcher::projection::{CalibrationProfile, CameraModel, Intrinsics, LensType, PanoLayout, PanoType};
use pano_stitcher::settings::StitcherSettings;
use pano_stitcher::telemetry::{init_logging, LogConfig};
use pano_stitcher::{FrameView, PixelFormat, StitchRenderer};

const DEMO_WIDTH: u32 = 640;
const DEMO_HEIGHT: u32 = 360;

/// Per-camera colours for the synthetic frames
const PALETTE: [[u8; 3]; 6] = [
    [230, 40, 40],
    [40, 80, 230],
    [40, 200, 60],
    [230, 200, 40],
    [200, 40, 200],
    [40, 200, 200],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    Software,
    Wgpu,
}

#[derive(Debug)]
struct Args {
    profile: Option<PathBuf>,
    settings: Option<PathBuf>,
    pano: Option<PanoType>,
    backend: BackendKind,
    ticks: u32,
    out: PathBuf,
}

fn usage() -> &'static str {
    "usage: pano-stitcher [--profile FILE.json] [--settings FILE.xml] [--pano NAME] \
     [--backend software|wgpu] [--ticks N] [--out FILE.png]"
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        profile: None,
        settings: None,
        pano: None,
        backend: BackendKind::Software,
        ticks: 10,
        out: PathBuf::from("snapshot.png"),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        if flag == "--help" || flag == "-h" {
            return Err(usage().to_string());
        }
        let value = iter.next().ok_or_else(|| format!("{flag} needs a value\n{}", usage()))?;
        match flag.as_str() {
            "--profile" => args.profile = Some(PathBuf::from(value)),
            "--settings" => args.settings = Some(PathBuf::from(value)),
            "--pano" => args.pano = Some(value.parse().map_err(|e| format!("{e}"))?),
            "--backend" => {
                args.backend = match value.as_str() {
                    "software" => BackendKind::Software,
                    "wgpu" => BackendKind::Wgpu,
                    other => return Err(format!("unknown backend {other}")),
                }
            }
            "--ticks" => args.ticks = value.parse().map_err(|_| format!("invalid tick count {value}"))?,
            "--out" => args.out = PathBuf::from(value),
            other => return Err(format!("unknown option {other}\n{}", usage())),
        }
    }
    Ok(args)
}

/// Two rectilinear cameras 90° apart with ~120° horizontal field of view
fn demo_profile() -> Result<CalibrationProfile, pano_stitcher::RecoverableError> {
    let fx = f64::from(DEMO_WIDTH) * 0.5 / 60f64.to_radians().tan();
    let intrinsics = Intrinsics {
        fx,
        fy: fx,
        cx: f64::from(DEMO_WIDTH) * 0.5,
        cy: f64::from(DEMO_HEIGHT) * 0.5,
    };
    let cameras = [-45.0f64, 45.0]
        .iter()
        .map(|yaw| {
            CameraModel::from_yaw_pitch_roll(LensType::Rectilinear, yaw.to_radians(), 0.0, 0.0).with_intrinsics(
                DEMO_WIDTH,
                DEMO_HEIGHT,
                intrinsics,
            )
        })
        .collect();
    let layouts = PanoType::ALL.iter().map(|&t| PanoLayout::new(t)).collect();
    CalibrationProfile::new(cameras, layouts)
}

fn backend_factory(kind: BackendKind) -> BackendFactory {
    match kind {
        BackendKind::Software => Box::new(|| Ok(Box::new(SoftwareBackend::new()) as Box<dyn GraphicsBackend>)),
        BackendKind::Wgpu => Box::new(|| Ok(Box::new(WgpuBackend::new()?) as Box<dyn GraphicsBackend>)),
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let profile = match &args.profile {
        Some(path) => CalibrationProfile::from_json_str(&std::fs::read_to_string(path)?)?,
        None => demo_profile()?,
    };
    let settings = match &args.settings {
        Some(path) => StitcherSettings::load(path)?,
        None => StitcherSettings::load_or_default(),
    };

    let mut renderer = StitchRenderer::new(profile, &settings)?;
    if let Some(pano) = args.pano {
        renderer.set_pano_type(pano)?;
    }
    renderer.init(backend_factory(args.backend))?;

    let (width, height) = renderer
        .profile()
        .cameras()
        .first()
        .and_then(|c| c.resolutions().next())
        .unwrap_or((DEMO_WIDTH, DEMO_HEIGHT));
    let frames: Vec<Vec<u8>> = (0..renderer.camera_count())
        .map(|camera| {
            let colour = PALETTE[camera % PALETTE.len()];
            colour
                .iter()
                .copied()
                .cycle()
                .take(width as usize * height as usize * 3)
                .collect()
        })
        .collect();

    let snapshot = renderer.request_snapshot()?;
    let tick = Duration::from_secs_f64(1.0 / f64::from(settings.target_fps.max(1)));
    for _ in 0..args.ticks.max(1) {
        for (camera, data) in frames.iter().enumerate() {
            let frame = FrameView::packed(PixelFormat::Rgb24, width, height, data);
            renderer.submit_frame(camera, &frame)?;
        }
        std::thread::sleep(tick);
    }

    let frame = snapshot.recv_timeout(Duration::from_secs(10))?;
    let image = image::RgbaImage::from_raw(frame.width, frame.height, frame.data.to_vec())
        .ok_or("snapshot size does not match its pixel data")?;
    image.save(&args.out)?;

    let stats = renderer.stats();
    tracing::info!(
        "Wrote {}x{} {} snapshot to {} ({} ticks, {:.1} fps, {} patches)",
        frame.width,
        frame.height,
        renderer.pano_type(),
        args.out.display(),
        stats.ticks,
        stats.fps,
        stats.patch_count
    );
    renderer.destroy();
    Ok(())
}

fn main() {
    let _log_guard = match init_logging(&LogConfig::default()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e}");
            None
        }
    };

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        tracing::error!("pano-stitcher failed: {}", e);
        std::process::exit(1);
    }
}
