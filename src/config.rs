use crate::error::{AdbError, Result};
use log::debug;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5037;
pub const DEFAULT_DEVICE_TEMP_PATH: &str = "/data/local/tmp";

const CONFIG_FILE_NAME: &str = ".adbwire.toml";
const SERVER_PORT_ENV: &str = "ANDROID_ADB_SERVER_PORT";

/// Where the ADB server lives and how sessions talk to it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Scratch directory on the device used by higher-level consumers
    pub device_temp_path: String,
    /// Socket read/write timeout. `None` blocks for as long as the server does.
    pub io_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            device_temp_path: DEFAULT_DEVICE_TEMP_PATH.to_string(),
            io_timeout_secs: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Load `~/.adbwire.toml`, falling back to defaults when it does not exist
    pub fn load() -> Result<Self> {
        let config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path)?,
            _ => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        Ok(config.with_env_overrides())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading config from: {:?}", path);
        let content = fs::read_to_string(path)
            .map_err(|e| AdbError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| AdbError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(content)?;
        debug!("Parsed config: {:?}", config);
        Ok(config)
    }

    fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(SERVER_PORT_ENV) {
            match value.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => debug!("Ignoring {}={:?}", SERVER_PORT_ENV, value),
            }
        }
        self
    }

    pub fn with_device_temp_path(mut self, path: impl Into<String>) -> Self {
        self.device_temp_path = path.into();
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// `host:port` of the server, with `localhost` pinned to IPv4
    pub fn address(&self) -> String {
        format!(
            "{}:{}",
            if self.host == "localhost" {
                "127.0.0.1"
            } else {
                &self.host
            },
            self.port
        )
    }

    /// Socket timeout to apply, if any. Zero means no timeout, as it does for sockets.
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
