use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{
    Background, EncodeOptions, Quality, DEFAULT_DELAY_MS, DEFAULT_HEIGHT, DEFAULT_WIDTH,
};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "GIFSMITH_DATA_DIR";
pub const ENV_PORT: &str = "PORT";

pub const DEFAULT_MAX_FRAMES: usize = 10;
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_CANVAS_PIXELS: u64 = 2048 * 2048;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub encode: EncodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Upper bound on frames per request.
    pub max_frames: usize,
    pub max_body_bytes: usize,
    /// Request/response encodes allowed to run at once.
    pub max_concurrent_encodes: usize,
}

/// Defaults applied to requests that omit them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncodeConfig {
    pub width: u32,
    pub height: u32,
    pub quality: Quality,
    pub default_delay_ms: u32,
    pub background: Background,
    /// Largest `width * height` a request may ask for. Capped by
    /// `types::MAX_CANVAS_PIXELS` regardless of this value.
    pub max_canvas_pixels: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            max_frames: DEFAULT_MAX_FRAMES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_concurrent_encodes: 1,
        }
    }
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            quality: Quality::default(),
            default_delay_ms: DEFAULT_DELAY_MS,
            background: Background::default(),
            max_canvas_pixels: DEFAULT_MAX_CANVAS_PIXELS,
        }
    }
}

impl EncodeConfig {
    pub fn options(&self) -> EncodeOptions {
        EncodeOptions {
            width: self.width,
            height: self.height,
            quality: self.quality,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply the `PORT` environment override, if set and valid.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env::var(ENV_PORT).ok().and_then(|raw| raw.trim().parse().ok()) {
            self.server.port = port;
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. GIFSMITH_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and a default config.toml on first run. An existing
/// config is never overwritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}
