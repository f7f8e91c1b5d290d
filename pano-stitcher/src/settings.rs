//! Settings management for the stitcher
//!
//! Handles loading/saving of the `PanoStitcherSettings` XML file. Every field
//! has a default so partial files load; `validated` clamps whatever a hand
//! edited file got wrong.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::frame::{OverflowPolicy, RingBufferConfig};
use crate::gpu::Viewport;
use crate::patch::BlendConfig;
use crate::projection::PanoType;
use crate::scene::{SceneConfig, Tessellation};

/// Grid size of one tessellated surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segments {
    #[serde(rename = "@columns")]
    pub columns: u32,
    #[serde(rename = "@rows")]
    pub rows: u32,
}

impl Segments {
    fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    fn pair(self) -> (u32, u32) {
        (self.columns, self.rows)
    }
}

/// Colour the display is cleared to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClearColor {
    #[serde(rename = "@r")]
    pub r: f32,
    #[serde(rename = "@g")]
    pub g: f32,
    #[serde(rename = "@b")]
    pub b: f32,
    #[serde(rename = "@a")]
    pub a: f32,
}

impl Default for ClearColor {
    fn default() -> Self {
        Self {
            r: 0.0,
            g: 0.0,
            b: 0.0,
            a: 1.0,
        }
    }
}

impl ClearColor {
    pub fn rgba(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Stitcher settings stored in `PanoStitcherSettings` XML files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "PanoStitcherSettings")]
pub struct StitcherSettings {
    /// Scheduler tick rate (1-240)
    #[serde(rename = "targetFps", default = "default_target_fps")]
    pub target_fps: u32,

    /// Frames of the newest size each camera's ring buffer holds
    #[serde(rename = "ringBufferFrames", default = "default_ring_buffer_frames")]
    pub ring_buffer_frames: usize,

    /// What a full ring buffer does with a new frame
    #[serde(rename = "ringBufferPolicy", default)]
    pub ring_buffer_policy: OverflowPolicy,

    /// Hard per-camera ring buffer limit
    #[serde(rename = "maxRingBufferBytes", default = "default_max_ring_buffer_bytes")]
    pub max_ring_buffer_bytes: usize,

    /// Edge weight sharpness for the blend
    #[serde(rename = "blendExponent", default = "default_blend_exponent")]
    pub blend_exponent: f64,

    /// Edge weight sharpness for the binocular layout
    #[serde(rename = "annulusBlendExponent", default = "default_annulus_blend_exponent")]
    pub annulus_blend_exponent: f64,

    /// Most cameras blended by one patch; also limited by the device
    #[serde(rename = "maxCamerasPerPatch", default = "default_max_cameras_per_patch")]
    pub max_cameras_per_patch: usize,

    /// Download contexts in flight (1-8)
    #[serde(rename = "downloadPoolSize", default = "default_download_pool_size")]
    pub download_pool_size: usize,

    /// Callback output size relative to the draw region (0.1-4.0)
    #[serde(rename = "outputScale", default = "default_output_scale")]
    pub output_scale: f64,

    #[serde(rename = "sphereSegments", default = "default_sphere_segments")]
    pub sphere_segments: Segments,

    #[serde(rename = "cylinderSegments", default = "default_cylinder_segments")]
    pub cylinder_segments: Segments,

    #[serde(rename = "planeSegments", default = "default_plane_segments")]
    pub plane_segments: Segments,

    #[serde(rename = "clearColor", default)]
    pub clear_color: ClearColor,

    /// Layout shown at start-up
    #[serde(rename = "panoType", default)]
    pub pano_type: PanoType,

    /// Initial draw region width in output pixels
    #[serde(rename = "drawWidth", default = "default_draw_width")]
    pub draw_width: u32,

    /// Initial draw region height in output pixels
    #[serde(rename = "drawHeight", default = "default_draw_height")]
    pub draw_height: u32,

    /// Longest an un-projection call waits for the render thread
    #[serde(rename = "unprojectTimeoutMs", default = "default_unproject_timeout_ms")]
    pub unproject_timeout_ms: u64,
}

fn default_target_fps() -> u32 {
    30
}

fn default_ring_buffer_frames() -> usize {
    3
}

fn default_max_ring_buffer_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_blend_exponent() -> f64 {
    20.0
}

fn default_annulus_blend_exponent() -> f64 {
    5.0
}

fn default_max_cameras_per_patch() -> usize {
    4
}

fn default_download_pool_size() -> usize {
    3
}

fn default_output_scale() -> f64 {
    1.0
}

fn default_sphere_segments() -> Segments {
    Segments::new(128, 64)
}

fn default_cylinder_segments() -> Segments {
    Segments::new(128, 16)
}

fn default_plane_segments() -> Segments {
    Segments::new(64, 32)
}

fn default_draw_width() -> u32 {
    1280
}

fn default_draw_height() -> u32 {
    720
}

fn default_unproject_timeout_ms() -> u64 {
    1000
}

impl Default for StitcherSettings {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            ring_buffer_frames: default_ring_buffer_frames(),
            ring_buffer_policy: OverflowPolicy::default(),
            max_ring_buffer_bytes: default_max_ring_buffer_bytes(),
            blend_exponent: default_blend_exponent(),
            annulus_blend_exponent: default_annulus_blend_exponent(),
            max_cameras_per_patch: default_max_cameras_per_patch(),
            download_pool_size: default_download_pool_size(),
            output_scale: default_output_scale(),
            sphere_segments: default_sphere_segments(),
            cylinder_segments: default_cylinder_segments(),
            plane_segments: default_plane_segments(),
            clear_color: ClearColor::default(),
            pano_type: PanoType::default(),
            draw_width: default_draw_width(),
            draw_height: default_draw_height(),
            unproject_timeout_ms: default_unproject_timeout_ms(),
        }
    }
}

impl StitcherSettings {
    /// Load settings from an XML file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(SettingsError::Io)?;
        Ok(Self::from_xml_str(&contents)?.validated())
    }

    pub fn from_xml_str(xml: &str) -> Result<Self, SettingsError> {
        from_str(xml).map_err(SettingsError::XmlParse)
    }

    pub fn to_xml_string(&self) -> Result<String, SettingsError> {
        let xml = to_string(self).map_err(SettingsError::XmlWrite)?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", xml))
    }

    /// Save settings to an XML file
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(SettingsError::Io)?;
            }
        }
        fs::write(path, self.to_xml_string()?).map_err(SettingsError::Io)
    }

    /// Default settings file location in the user config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("PanoStitcher");
            p.push("settings.xml");
            p
        })
    }

    /// Settings from the default location, or defaults when missing or unreadable
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring settings at {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Copy with every value clamped into its accepted range
    pub fn validated(&self) -> Self {
        let mut s = self.clone();
        s.target_fps = s.target_fps.clamp(1, 240);
        s.ring_buffer_frames = s.ring_buffer_frames.clamp(1, 64);
        s.max_ring_buffer_bytes = s.max_ring_buffer_bytes.max(1024);
        s.blend_exponent = finite_or(s.blend_exponent, default_blend_exponent()).clamp(1.0, 100.0);
        s.annulus_blend_exponent =
            finite_or(s.annulus_blend_exponent, default_annulus_blend_exponent()).clamp(1.0, 100.0);
        s.max_cameras_per_patch = s.max_cameras_per_patch.clamp(1, crate::projection::MAX_CAMERAS);
        s.download_pool_size = s.download_pool_size.clamp(1, 8);
        s.output_scale = finite_or(s.output_scale, default_output_scale()).clamp(0.1, 4.0);
        for segments in [&mut s.sphere_segments, &mut s.cylinder_segments, &mut s.plane_segments] {
            segments.columns = segments.columns.clamp(4, 1024);
            segments.rows = segments.rows.clamp(1, 512);
        }
        s.draw_width = s.draw_width.max(1);
        s.draw_height = s.draw_height.max(1);
        s.unproject_timeout_ms = s.unproject_timeout_ms.max(1);

        if s != *self {
            tracing::warn!("Settings adjusted to their accepted ranges");
        }
        s
    }

    pub fn ring_buffer_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            frames: self.ring_buffer_frames,
            policy: self.ring_buffer_policy,
            max_bytes: self.max_ring_buffer_bytes,
        }
    }

    pub fn tessellation(&self) -> Tessellation {
        Tessellation {
            sphere: self.sphere_segments.pair(),
            cylinder: self.cylinder_segments.pair(),
            plane: self.plane_segments.pair(),
        }
    }

    pub fn scene_config(&self) -> SceneConfig {
        SceneConfig {
            tessellation: self.tessellation(),
            blend: BlendConfig {
                exponent: self.blend_exponent,
                max_cameras_per_patch: self.max_cameras_per_patch,
            },
            annulus_exponent: self.annulus_blend_exponent,
        }
    }

    pub fn draw_region(&self) -> Viewport {
        Viewport::full(self.draw_width, self.draw_height)
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Settings-related errors
#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    XmlParse(quick_xml::DeError),
    XmlWrite(quick_xml::SeError),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "IO error: {}", e),
            SettingsError::XmlParse(e) => write!(f, "XML parse error: {}", e),
            SettingsError::XmlWrite(e) => write!(f, "XML write error: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = StitcherSettings::default();
        assert_eq!(settings.target_fps, 30);
        assert_eq!(settings.ring_buffer_policy, OverflowPolicy::Overwrite);
        assert_eq!(settings.scene_config(), SceneConfig::default());
        assert_eq!(settings.ring_buffer_config(), RingBufferConfig::default());
        assert_eq!(settings.validated(), settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let xml = r#"<PanoStitcherSettings>
            <targetFps>60</targetFps>
            <panoType>Cylinder</panoType>
            <cylinderSegments columns="64" rows="8"/>
        </PanoStitcherSettings>"#;
        let settings = StitcherSettings::from_xml_str(xml).unwrap();
        assert_eq!(settings.target_fps, 60);
        assert_eq!(settings.pano_type, PanoType::Cylinder);
        assert_eq!(settings.tessellation().cylinder, (64, 8));
        assert_eq!(settings.tessellation().sphere, (128, 64));
        assert_eq!(settings.download_pool_size, 3);
    }

    #[test]
    fn test_xml_round_trip() {
        let mut settings = StitcherSettings::default();
        settings.ring_buffer_policy = OverflowPolicy::Reject;
        settings.output_scale = 0.5;
        settings.clear_color = ClearColor {
            r: 0.25,
            g: 0.5,
            b: 0.0,
            a: 1.0,
        };
        let xml = settings.to_xml_string().unwrap();
        assert!(xml.starts_with("<?xml"));
        assert_eq!(StitcherSettings::from_xml_str(&xml).unwrap(), settings);
    }

    #[test]
    fn test_validated_clamps() {
        let mut settings = StitcherSettings::default();
        settings.target_fps = 0;
        settings.download_pool_size = 100;
        settings.output_scale = f64::NAN;
        settings.max_cameras_per_patch = 0;
        let v = settings.validated();
        assert_eq!(v.target_fps, 1);
        assert_eq!(v.download_pool_size, 8);
        assert_eq!(v.output_scale, 1.0);
        assert_eq!(v.max_cameras_per_patch, 1);
    }
}
