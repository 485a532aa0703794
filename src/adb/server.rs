use crate::adb::connection::{AdbConnection, CancelToken};
use crate::config::ClientConfig;
use crate::core::types::{DeviceId, ForwardRule};
use crate::device::Device;
use crate::error::{AdbError, Result};
use log::*;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static RE_DEVICE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(\S+)(.*)$").expect("valid device line regex"));
static RE_DEVICE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z_]+):(\S+)").expect("valid device attribute regex"));

/// The ADB server at a configured address.
///
/// Doubles as the connection factory for [`Device`] sessions: every call
/// opens a fresh socket, so clones can be used from any number of threads.
#[derive(Debug, Clone)]
pub struct AdbServer {
    config: Arc<ClientConfig>,
}

impl AdbServer {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Server described by `~/.adbwire.toml` and the environment
    pub fn from_default_config() -> Result<Self> {
        Ok(Self::new(ClientConfig::load()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a new, unbound connection
    pub fn connect(&self) -> Result<AdbConnection> {
        AdbConnection::open(&self.config)
    }

    pub fn connect_with_cancel(&self, token: &CancelToken) -> Result<AdbConnection> {
        AdbConnection::open_with_cancel(&self.config, token)
    }

    /// Run a host command that only answers with a status
    pub fn execute(&self, service: &str) -> Result<()> {
        let mut conn = self.connect()?;
        let result = conn.execute(service);
        conn.close();
        result
    }

    /// Run a host command whose reply is a hex-length-prefixed string
    pub fn query(&self, service: &str) -> Result<String> {
        let mut conn = self.connect()?;
        let result = conn
            .execute(service)
            .and_then(|()| conn.read_length_prefixed_string());
        conn.close();
        result
    }

    /// Internal protocol version of the server (`host:version`)
    pub fn version(&self) -> Result<u32> {
        let reply = self.query("host:version")?;
        u32::from_str_radix(reply.trim(), 16)
            .map_err(|_| AdbError::protocol(format!("invalid version reply {:?}", reply)))
    }

    /// Check whether anything answers `host:version` at the configured address
    pub fn is_running(&self) -> bool {
        match self.version() {
            Ok(version) => {
                debug!("ADB server {} is running, version {}", self.config.address(), version);
                true
            }
            Err(e) => {
                debug!("ADB server {} is not usable: {}", self.config.address(), e);
                false
            }
        }
    }

    /// Every device the server knows about, with the attributes `devices-l` reports
    pub fn devices(&self) -> Result<Vec<Device>> {
        let reply = self.query("host:devices-l")?;
        let devices: Vec<Device> = reply
            .lines()
            .filter_map(parse_device_line)
            .map(|(serial, attrs)| Device::new(self.clone(), serial, attrs))
            .collect();
        debug!("Found {} devices", devices.len());
        Ok(devices)
    }

    /// A session for `serial` without cached attributes
    pub fn device(&self, serial: impl Into<DeviceId>) -> Device {
        Device::new(self.clone(), serial.into(), HashMap::new())
    }

    /// All forward rules on the server, across devices
    pub fn forward_list(&self) -> Result<Vec<ForwardRule>> {
        let reply = self.query("host:list-forward")?;
        Ok(reply.lines().filter_map(ForwardRule::parse_line).collect())
    }
}

/// Split a `devices-l` line into its serial and `state` plus `key:value` attributes
pub(crate) fn parse_device_line(line: &str) -> Option<(DeviceId, HashMap<String, String>)> {
    let caps = RE_DEVICE_LINE.captures(line.trim())?;
    let serial = DeviceId::new(&caps[1]);

    let mut attrs = HashMap::new();
    attrs.insert("state".to_string(), caps[2].to_string());
    for attr in RE_DEVICE_ATTR.captures_iter(&caps[3]) {
        attrs.insert(attr[1].to_string(), attr[2].to_string());
    }
    Some((serial, attrs))
}
