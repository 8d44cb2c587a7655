//! Configuration for the Mosaic compositor
//!
//! Loads configuration from TOML file at `~/.config/mosaic/config.toml`
//! Auto-generates default config file on first run if missing.
//! `MOSAIC_CONFIG` points at another file; a `.json` one is read as JSON.

use crate::format::{Fourcc, PixelFormat};
use crate::renderer::Color;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compositor: CompositorConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let config = Self::load_from(&config_path)?;
        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse a config file, picking the format from its extension
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).context("Failed to parse JSON config file")
        } else {
            toml::from_str(&content).context("Failed to parse config file")
        }
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("MOSAIC_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("mosaic");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Composition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Pixel format: "auto" or a fourcc code such as "AR24" / "0x34325241"
    pub format: String,
    /// Modifier to insist on; any common modifier when unset
    pub modifier: Option<u64>,
    /// With format "auto": try 32bit formats before 16bit ones
    pub prefer_high_quality: bool,
    /// Background color: RGBA values 0.0-1.0
    pub background: [f32; 4],
    /// Socket file name of the descriptor exchange, under XDG_RUNTIME_DIR
    pub buffer_connector: String,
    /// Render device to hand out to clients; the headless backend uses an
    /// anonymous handle when unset
    pub render_node: Option<PathBuf>,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            format: "AR24".to_string(),
            modifier: None,
            prefer_high_quality: true,
            background: [1.0, 0.411, 0.705, 1.0], // Pink
            buffer_connector: "mosaic-buffers.sock".to_string(),
            render_node: None,
        }
    }
}

impl CompositorConfig {
    /// The format to negotiate for
    pub fn requested_format(&self) -> Result<PixelFormat> {
        let fourcc: Fourcc = self
            .format
            .parse()
            .with_context(|| format!("Invalid format {:?}", self.format))?;
        Ok(PixelFormat::new(fourcc, self.modifier))
    }

    pub fn background(&self) -> Color {
        Color::from(self.background)
    }
}

/// Output (display connector) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Connector name, e.g. "card0-HDMI-A-1"
    pub connector: String,
    pub width: u32,
    pub height: u32,
    /// Refresh rate in Hz
    pub refresh_rate: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            connector: "HEADLESS-1".to_string(),
            width: 1920,
            height: 1080,
            refresh_rate: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MODIFIER_LINEAR;

    #[test]
    fn test_default_roundtrip() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.output.refresh_rate, 60);
        assert_eq!(parsed.compositor.buffer_connector, "mosaic-buffers.sock");
        assert!(parsed.compositor.modifier.is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [compositor]
            format = "XR24"
            modifier = 0

            [output]
            connector = "card0-HDMI-A-1"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.output.connector, "card0-HDMI-A-1");
        assert_eq!(parsed.output.width, 1920);
        assert_eq!(
            parsed.compositor.requested_format().unwrap(),
            PixelFormat::new(Fourcc::XRGB8888, [MODIFIER_LINEAR])
        );
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!("mosaic-config-{}.json", std::process::id()));
        fs::write(
            &path,
            r#"{ "compositor": { "format": "auto", "prefer_high_quality": false },
                 "output": { "width": 1280, "height": 720 } }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(config.output.width, 1280);
        assert!(!config.compositor.prefer_high_quality);
        assert!(!config.compositor.requested_format().unwrap().is_valid());
    }

    #[test]
    fn test_invalid_format_is_reported() {
        let config = CompositorConfig {
            format: "not-a-format".to_string(),
            ..Default::default()
        };
        assert!(config.requested_format().is_err());
    }
}
