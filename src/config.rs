// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// The file is read by the application layer (the demo binary). The renderer
// itself only ever sees the `Capabilities` record derived from it.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound on frames in flight; more slots only add latency.
pub const MAX_FRAMES_IN_FLIGHT_LIMIT: usize = 5;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub renderer: RendererConfig,
    pub assets: AssetConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Core".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Which passes the renderer records every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum RendererMode {
    /// Skybox pass plus depth-tested geometry.
    #[default]
    #[serde(rename = "scene3d")]
    Scene3D,
    /// Geometry only, no depth test and no skybox.
    #[serde(rename = "overlay2d")]
    Overlay2D,
}

/// Renderer settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub mode: RendererMode,
    pub vsync: bool,
    pub max_frames_in_flight: usize,
    pub max_indices: u32,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            mode: RendererMode::Scene3D,
            vsync: true,
            max_frames_in_flight: 2,
            max_indices: 1 << 20,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Where the application finds pre-built assets on disk
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub geometry_vert: PathBuf,
    pub geometry_frag: PathBuf,
    pub skybox_vert: PathBuf,
    pub skybox_frag: PathBuf,
    pub pipeline_cache: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            geometry_vert: PathBuf::from("shaders/geometry.vert.spv"),
            geometry_frag: PathBuf::from("shaders/geometry.frag.spv"),
            skybox_vert: PathBuf::from("shaders/skybox.vert.spv"),
            skybox_frag: PathBuf::from("shaders/skybox.frag.spv"),
            pipeline_cache: PathBuf::from("pipeline_cache.bin"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// Everything the renderer needs to know about its host, supplied once at
/// construction.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub app_name: String,
    pub app_version: u32,
    pub max_indices: u32,
    pub max_frames_in_flight: usize,
    pub mode: RendererMode,
    pub vsync: bool,
    pub validation: bool,
    pub clear_color: [f32; 4],
    /// Initial drawable size; later sizes arrive through `Renderer::resize`.
    pub width: u32,
    pub height: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        let renderer = RendererConfig::default();
        let window = WindowConfig::default();
        Self {
            app_name: window.title,
            app_version: ash::vk::make_api_version(0, 0, 1, 0),
            max_indices: renderer.max_indices,
            max_frames_in_flight: renderer.max_frames_in_flight,
            mode: renderer.mode,
            vsync: renderer.vsync,
            validation: false,
            clear_color: renderer.clear_color,
            width: window.width,
            height: window.height,
        }
    }
}

impl Capabilities {
    /// Frames in flight clamped to the supported range.
    pub fn frames_in_flight(&self) -> usize {
        clamp_frames_in_flight(self.max_frames_in_flight)
    }
}

/// Clamp a requested frames-in-flight count to [1, 5].
pub fn clamp_frames_in_flight(requested: usize) -> usize {
    let clamped = requested.clamp(1, MAX_FRAMES_IN_FLIGHT_LIMIT);
    if clamped != requested {
        log::warn!(
            "max_frames_in_flight {} out of range, using {}",
            requested,
            clamped
        );
    }
    clamped
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Build the renderer capabilities record
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            app_name: self.window.title.clone(),
            app_version: ash::vk::make_api_version(0, 0, 1, 0),
            max_indices: self.renderer.max_indices,
            max_frames_in_flight: self.renderer.max_frames_in_flight,
            mode: self.renderer.mode,
            vsync: self.renderer.vsync,
            validation: cfg!(debug_assertions) && self.debug.validation_layers,
            clear_color: self.renderer.clear_color,
            width: self.window.width,
            height: self.window.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.renderer.max_frames_in_flight, 2);
        assert_eq!(config.renderer.mode, RendererMode::Scene3D);
        assert!(config.renderer.vsync);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [renderer]
            mode = "overlay2d"
            max_frames_in_flight = 3
            vsync = false
            "#,
        )
        .unwrap();
        assert_eq!(config.renderer.mode, RendererMode::Overlay2D);
        assert_eq!(config.renderer.max_frames_in_flight, 3);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        assert_eq!(clamp_frames_in_flight(0), 1);
        assert_eq!(clamp_frames_in_flight(3), 3);
        assert_eq!(clamp_frames_in_flight(9), 5);
    }

    #[test]
    fn capabilities_follow_config() {
        let config = Config::parse(
            r#"
            [window]
            title = "demo"
            [renderer]
            max_indices = 96
            "#,
        )
        .unwrap();
        let caps = config.capabilities();
        assert_eq!(caps.app_name, "demo");
        assert_eq!(caps.max_indices, 96);
    }
}
