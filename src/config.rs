// Tracer configuration load/save

use crate::error::TraceError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = ".config/procnet";
const CONFIG_FILE: &str = "config.json";

/// Live capture session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Bytes kept per frame; enough for link + IP + transport headers
    #[serde(default = "default_snaplen")]
    pub snaplen: usize,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default)]
    pub promiscuous: bool,

    /// Protocol filter expression, see `CaptureFilter::parse`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_snaplen() -> usize {
    1600
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_filter() -> String {
    "tcp || udp".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snaplen: default_snaplen(),
            read_timeout_ms: default_read_timeout_ms(),
            promiscuous: false,
            filter: default_filter(),
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerConfig {
    /// OS connection table poll period
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    #[serde(default)]
    pub capture: CaptureConfig,

    /// Preferred capture backend
    #[serde(default)]
    pub preferred_capture_backend: Option<String>,

    /// Preferred connection provider backend
    #[serde(default)]
    pub preferred_connection_provider: Option<String>,

    /// Device filter: None = every active device, Some([...]) = only these
    #[serde(default)]
    pub interfaces: Option<Vec<String>>,

    /// Pending faults the error channel holds before reporters block
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

fn default_error_channel_capacity() -> usize {
    16
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: None,
            capture: CaptureConfig::default(),
            preferred_capture_backend: None,
            preferred_connection_provider: None,
            interfaces: None,
            error_channel_capacity: default_error_channel_capacity(),
        }
    }
}

impl TracerConfig {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, TraceError> {
        let home = std::env::var("HOME")
            .map_err(|_| TraceError::Config("HOME environment variable not set".to_string()))?;
        Ok(PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self, TraceError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, defaults when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self, TraceError> {
        if !path.exists() {
            log::debug!("Config file not found, using defaults");
            return Ok(TracerConfig::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| TraceError::Config(format!("failed to read {:?}: {}", path, e)))?;

        let config: TracerConfig = serde_json::from_str(&contents)
            .map_err(|e| TraceError::Config(format!("failed to parse {:?}: {}", path, e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to `path`, creating the parent directory
    pub fn save_to(&self, path: &Path) -> Result<(), TraceError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                TraceError::Config(format!("failed to create config directory {:?}: {}", dir, e))
            })?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| TraceError::Config(format!("failed to serialize config: {}", e)))?;

        fs::write(path, contents)
            .map_err(|e| TraceError::Config(format!("failed to write {:?}: {}", path, e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Poll period, falling back to `default` when not configured
    pub fn poll_interval_or(&self, default: Duration) -> Duration {
        self.poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Whether a device passes the `interfaces` allow-list
    pub fn allows_interface(&self, name: &str) -> bool {
        self.interfaces
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| n == name))
    }
}
