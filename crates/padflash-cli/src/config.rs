//! Configuration loading and defaults

use anyhow::{Context, Result};
use padflash_midi::FlashConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub flash: FlashSettings,
    #[serde(default)]
    pub midi: MidiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to the firmware catalog manifest
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
        }
    }
}

fn default_manifest() -> PathBuf {
    PathBuf::from("firmware/catalog.toml")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashSettings {
    /// Bytes per SysEx chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Pause after each delivered chunk
    #[serde(default = "default_chunk_delay")]
    pub chunk_delay_ms: u64,
    /// Extra attempts per chunk before the transfer fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Time given to the device to commit the image
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// How long to wait for the bootloader before giving up
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            settle_delay_ms: default_settle_delay(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl FlashSettings {
    pub fn to_flash_config(&self) -> FlashConfig {
        FlashConfig {
            chunk_size: self.chunk_size,
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

fn default_chunk_size() -> usize {
    256
}

fn default_chunk_delay() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    50
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_wait_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiConfig {
    /// Substring of the output port name
    #[serde(default = "default_output_port")]
    pub output_port: String,
    /// Substring of the input port name (defaults to `output_port`)
    #[serde(default)]
    pub input_port: Option<String>,
    /// Identity request interval while waiting for the bootloader
    #[serde(default = "default_inquiry_interval")]
    pub inquiry_interval_ms: u64,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            output_port: default_output_port(),
            input_port: None,
            inquiry_interval_ms: default_inquiry_interval(),
        }
    }
}

impl MidiConfig {
    /// Apply a command line `--port` override to the output port
    ///
    /// An unset `input_port` follows the overridden output port.
    pub fn with_port_override(mut self, port: Option<String>) -> Self {
        if let Some(port) = port {
            self.output_port = port;
        }
        self
    }

    pub fn input_port(&self) -> &str {
        self.input_port.as_deref().unwrap_or(&self.output_port)
    }

    pub fn inquiry_interval(&self) -> Duration {
        Duration::from_millis(self.inquiry_interval_ms.max(1))
    }
}

fn default_output_port() -> String {
    "Launchpad".to_string()
}

fn default_inquiry_interval() -> u64 {
    500
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
