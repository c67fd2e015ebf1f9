// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing file or a partial file both work.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::frame::PresenterOptions;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub presentation: PresentationConfig,
    pub debug: DebugConfig,
    pub headless: HeadlessConfig,
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
            title: "Frame Pacer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    /// Prefer a CPU Vulkan implementation (lavapipe, SwiftShader)
    pub use_software_adapter: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [1.0, 0.0, 0.0, 0.0],
            use_software_adapter: false,
        }
    }
}

/// Frame pacing settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    /// Frame slots, and swapchain images
    pub frames_in_flight: usize,
    pub vsync: bool,
    /// Longest a fence wait may block before reporting a stall. 0 = forever.
    pub stall_timeout_ms: u64,
    /// Exit on the first stall instead of logging and retrying
    pub abort_on_stall: bool,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            vsync: true,
            stall_timeout_ms: 2000,
            abort_on_stall: false,
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
            log_file: "frame_pacer.log".to_string(),
            show_fps: true,
        }
    }
}

/// Run against the worker-thread GPU instead of a window
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub enabled: bool,
    pub frames: u64,
    /// Simulated GPU time per frame
    pub gpu_latency_ms: u64,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frames: 240,
            gpu_latency_ms: 4,
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults.
    ///
    /// Runs before logging is set up, so a load failure is handed back to
    /// the caller for reporting instead of being logged here.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    /// Defaults plus the error when `path` exists but cannot be used.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
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

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.presentation.frames_in_flight < 2 {
            anyhow::bail!(
                "presentation.frames_in_flight must be at least 2, got {}",
                self.presentation.frames_in_flight
            );
        }
        Ok(())
    }

    /// `None` means wait forever.
    pub fn stall_timeout(&self) -> Option<Duration> {
        match self.presentation.stall_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn presenter_options(&self, tearing_supported: bool) -> PresenterOptions {
        PresenterOptions {
            frames_in_flight: self.presentation.frames_in_flight,
            stall_timeout: self.stall_timeout(),
            vsync: self.presentation.vsync,
            tearing_supported,
            clear_color: self.graphics.clear_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.presentation.frames_in_flight, 3);
        assert!(config.presentation.vsync);
        assert_eq!(config.graphics.clear_color, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(config.stall_timeout(), Some(Duration::from_millis(2000)));
        assert!(!config.headless.enabled);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [presentation]
            frames_in_flight = 2
            vsync = false

            [window]
            title = "Pacing test"
            "#,
        )
        .unwrap();

        assert_eq!(config.presentation.frames_in_flight, 2);
        assert!(!config.presentation.vsync);
        assert_eq!(config.presentation.stall_timeout_ms, 2000);
        assert_eq!(config.window.title, "Pacing test");
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let config = Config::from_toml("[presentation]\nstall_timeout_ms = 0\n").unwrap();
        assert_eq!(config.stall_timeout(), None);
        assert_eq!(config.presenter_options(false).stall_timeout, None);
    }

    #[test]
    fn test_single_slot_rejected() {
        assert!(Config::from_toml("[presentation]\nframes_in_flight = 1\n").is_err());
    }

    #[test]
    fn test_presenter_options_follow_config() {
        let config = Config::from_toml(
            "[graphics]\nclear_color = [0.0, 0.5, 0.0, 1.0]\n[presentation]\nframes_in_flight = 4\n",
        )
        .unwrap();
        let options = config.presenter_options(true);
        assert_eq!(options.frames_in_flight, 4);
        assert!(options.tearing_supported);
        assert_eq!(options.clear_color, [0.0, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn test_malformed_file_gives_defaults_and_error() {
        let path = std::env::temp_dir().join(format!(
            "frame_pacer_bad_config_{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "[headless]\nenabled = true\n[presentation]\nframes_in_flight = \"three\"\n",
        )
        .unwrap();

        let (config, error) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        let error = error.expect("malformed file must report an error");
        assert!(format!("{:#}", error).contains("Failed to parse config file"));
        assert!(!config.headless.enabled);
        assert_eq!(config.presentation.frames_in_flight, 3);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let (_, error) = Config::load_or_default("definitely/not/here.toml");
        assert!(error.is_none());

        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.window.height, 720);
    }
}
