//! Logging setup
//!
//! The render thread, the control surface and the demo binary all log
//! through `tracing`. Console output is compact text or JSON; the optional
//! log file goes through a non-blocking appender so a slow disk never
//! stalls a render tick.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Filter directive variable, checked before `RUST_LOG`
pub const LOG_ENV: &str = "PANO_LOG";
/// Set to "json" for JSON console output
pub const LOG_FORMAT_ENV: &str = "PANO_LOG_FORMAT";

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub console_enabled: bool,
    /// Write to `file_path` (or `pano-stitcher.log`) as well
    pub file_enabled: bool,
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
    /// Directive used when no environment filter is set
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: None,
            json_format: false,
            default_level: "info".to_string(),
        }
    }
}

impl LogConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }

    fn use_json(&self) -> bool {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(self.json_format)
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive until exit; dropping it flushes and stops
/// the file writer. Render-thread events carry their thread name, so
/// scheduler output is easy to tell apart from callers.
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let use_json = config.use_json();

    let (file_layer, file_guard) = if config.file_enabled {
        let path = config
            .file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("pano-stitcher.log"));
        let (writer, guard) = tracing_appender::non_blocking(std::fs::File::create(&path)?);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let console = config.console_enabled;
    let json_layer = (console && use_json).then(|| {
        fmt::layer()
            .json()
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
    });
    let text_layer = (console && !use_json).then(|| fmt::layer().with_thread_names(true).compact());

    tracing_subscriber::registry()
        .with(config.filter())
        .with(file_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;

    tracing::info!(
        target: "pano_stitcher",
        version = env!("CARGO_PKG_VERSION"),
        json_format = use_json,
        file_enabled = config.file_enabled,
        "Logging initialized"
    );

    Ok(file_guard)
}

pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;
