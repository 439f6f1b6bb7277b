// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing or partial config.toml still
// yields a runnable setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Scene".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub anisotropy: bool,
    pub shader_dir: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.05, 0.05, 0.1, 1.0],
            max_frames_in_flight: 2,
            anisotropy: true,
            shader_dir: "shaders".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            show_fps: true,
        }
    }
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

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Frame-in-flight count with a floor of one slot.
    pub fn frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    /// Preferred present mode as a Vulkan enum. The swap chain falls back
    /// to FIFO when the surface doesn't support the preference.
    pub fn preferred_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            other => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", other);
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.frames_in_flight(), 2);
        assert_eq!(
            config.preferred_present_mode(),
            ash::vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn partial_config_keeps_defaults_elsewhere() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 800

            [graphics]
            present_mode = "fifo"
            "#,
        )
        .unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.preferred_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert!(config.debug.show_fps);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            present_mode = "quadruple-buffered"
            "#,
        )
        .unwrap();
        assert_eq!(config.preferred_present_mode(), ash::vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn frames_in_flight_has_a_floor_of_one() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            max_frames_in_flight = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.frames_in_flight(), 1);
    }
}
