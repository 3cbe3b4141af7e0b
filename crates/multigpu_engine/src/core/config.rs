//! # Unified Configuration System
//!
//! Configuration for device selection, the frame loop, CPU-side threading and
//! shader lookup. Every section is serializable so the whole [`EngineConfig`]
//! can be loaded from TOML or RON through the [`Config`] trait.

use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};

use crate::config::{Config, ConfigError};

/// # Shader Configuration
///
/// Where shader sources are looked up and which external compiler to invoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShaderConfig {
    /// Directories searched (in order) for relative shader paths
    pub search_dirs: Vec<PathBuf>,
    /// Explicit path to the `glslc` executable; resolved from `VULKAN_SDK` or `PATH` when unset
    pub compiler_path: Option<PathBuf>,
}

impl ShaderConfig {
    /// Resolve a shader path against the search directories
    ///
    /// Absolute paths and paths that already exist are returned unchanged.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            return path.to_path_buf();
        }
        self.search_dirs
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| path.to_path_buf())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            search_dirs: vec![
                PathBuf::from("resources/shaders"),
                PathBuf::from("shaders"),
                PathBuf::from("../resources/shaders"),
            ],
            compiler_path: None,
        }
    }
}

/// # Device Configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Open every eligible GPU, not just the primary one
    pub multi_gpu: bool,
    /// Whether to enable Vulkan validation layers (auto-detected from build type when `None`)
    pub enable_validation: Option<bool>,
}

impl DeviceConfig {
    /// Whether validation should be enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            multi_gpu: false,
            enable_validation: None,
        }
    }
}

/// # Renderer Configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RendererConfig {
    /// Maximum frames in flight per device
    pub frames_in_flight: usize,
    /// Prefer FIFO presentation over mailbox
    pub vsync: bool,
    /// Clear color for the color attachment
    pub clear_color: [f32; 4],
    /// Extent used before the surface reports one
    pub initial_extent: (u32, u32),
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            vsync: true,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            initial_extent: (1280, 720),
        }
    }
}

/// # Threading Configuration
///
/// The CPU pool gets `floor(hardware_threads * pool_fraction)` workers minus one
/// thread per GPU worker, but never fewer than `min_pool_threads`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadingConfig {
    /// Fraction of hardware concurrency given to the CPU pool
    pub pool_fraction: f32,
    /// Lower bound on pool size
    pub min_pool_threads: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            pool_fraction: 0.75,
            min_pool_threads: 1,
        }
    }
}

/// # Engine Configuration
///
/// Top-level configuration consumed by [`crate::core::EngineContext`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Device selection settings
    pub devices: DeviceConfig,
    /// Frame loop settings
    pub renderer: RendererConfig,
    /// CPU pool settings
    pub threading: ThreadingConfig,
    /// Shader lookup settings
    pub shaders: ShaderConfig,
}

impl Config for EngineConfig {}

impl EngineConfig {
    /// Create a configuration with defaults for the given application
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable multi-GPU device initialization
    pub fn with_multi_gpu(mut self, enabled: bool) -> Self {
        self.devices.multi_gpu = enabled;
        self
    }

    /// Force validation layers on or off
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.devices.enable_validation = Some(enabled);
        self
    }

    /// Set maximum frames in flight
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.renderer.frames_in_flight = frames;
        self
    }

    /// Set the initial surface extent
    pub fn with_initial_extent(mut self, width: u32, height: u32) -> Self {
        self.renderer.initial_extent = (width, height);
        self
    }

    /// Set custom shader configuration
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renderer.frames_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "renderer.frames_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.threading.pool_fraction > 0.0 && self.threading.pool_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "threading.pool_fraction",
                reason: format!("{} is outside (0, 1]", self.threading.pool_fraction),
            });
        }
        let (width, height) = self.renderer.initial_extent;
        if width == 0 || height == 0 {
            return Err(ConfigError::Invalid {
                field: "renderer.initial_extent",
                reason: format!("{}x{} is empty", width, height),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::new("test");
        assert!(config.validate().is_ok());
        assert_eq!(config.renderer.frames_in_flight, 2);
        assert!(!config.devices.multi_gpu);
    }

    #[test]
    fn test_rejects_zero_frames_in_flight() {
        let config = EngineConfig::new("test").with_frames_in_flight(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "renderer.frames_in_flight", .. })
        ));
    }

    #[test]
    fn test_rejects_pool_fraction_out_of_range() {
        let mut config = EngineConfig::new("test");
        config.threading.pool_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_multi_gpu() {
        let config = EngineConfig::new("viewer").with_multi_gpu(true);
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = EngineConfig::parse("engine.toml", &text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let parsed = EngineConfig::parse("engine.ron", "(application_name: \"ron\")").unwrap();
        assert_eq!(parsed.application_name, "ron");
        assert_eq!(parsed.renderer, RendererConfig::default());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        assert!(matches!(
            EngineConfig::parse("engine.json", "{}"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let parsed = EngineConfig::load_or_default("does/not/exist/engine.toml").unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
