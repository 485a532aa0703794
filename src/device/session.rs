use crate::adb::connection::{AdbConnection, CancelToken};
use crate::adb::file_transfer::SyncSession;
use crate::adb::server::AdbServer;
use crate::adb::shell::ShellCommand;
use crate::core::types::{DeviceFileInfo, DeviceId, DeviceState, ForwardRule};
use crate::error::{AdbError, Result};
use chrono::{DateTime, Utc};
use log::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Mode used by [`Device::push_file`]
pub const DEFAULT_FILE_MODE: u32 = 0o664;
/// Port adbd listens on after `tcpip:` unless told otherwise
pub const DEFAULT_ADBD_TCP_PORT: u16 = 5555;

/// One device as seen through the ADB server.
///
/// Holds no socket. Each operation opens a new connection, binds it to the
/// serial, runs exactly one command or sync operation and closes it again,
/// whether it succeeded or not.
#[derive(Debug, Clone)]
pub struct Device {
    server: AdbServer,
    serial: DeviceId,
    attrs: HashMap<String, String>,
}

impl Device {
    pub(crate) fn new(server: AdbServer, serial: DeviceId, attrs: HashMap<String, String>) -> Self {
        Self {
            server,
            serial,
            attrs,
        }
    }

    pub fn serial(&self) -> &DeviceId {
        &self.serial
    }

    /// Attributes captured from `devices-l` when this session was created
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attrs
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn product(&self) -> Option<&str> {
        self.attr("product")
    }

    pub fn model(&self) -> Option<&str> {
        self.attr("model")
    }

    pub fn usb(&self) -> Option<&str> {
        self.attr("usb")
    }

    pub fn transport_id(&self) -> Option<&str> {
        self.attr("transport_id")
    }

    pub fn is_usb(&self) -> bool {
        self.usb().is_some_and(|usb| !usb.is_empty())
    }

    /// `<device_temp_path>/<name>` for scratch files on the device
    pub fn temp_path(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.server.config().device_temp_path.trim_end_matches('/'),
            name.trim_start_matches('/')
        )
    }

    // =========================================================================
    // Server-side queries (host dispatcher, no device transport)
    // =========================================================================

    pub fn state(&self) -> Result<DeviceState> {
        let reply = self
            .server
            .query(&format!("host-serial:{}:get-state", self.serial))?;
        Ok(DeviceState::from(reply.as_str()))
    }

    pub fn device_path(&self) -> Result<String> {
        self.server
            .query(&format!("host-serial:{}:get-devpath", self.serial))
    }

    /// Forward local TCP port to a TCP port on the device
    pub fn forward(&self, local_port: u16, remote_port: u16, no_rebind: bool) -> Result<()> {
        self.forward_spec(
            &format!("tcp:{}", local_port),
            &format!("tcp:{}", remote_port),
            no_rebind,
        )
    }

    /// Forward with raw socket specs such as `tcp:8080` or `localabstract:foo`
    pub fn forward_spec(&self, local: &str, remote: &str, no_rebind: bool) -> Result<()> {
        let command = if no_rebind {
            format!("host-serial:{}:forward:norebind:{};{}", self.serial, local, remote)
        } else {
            format!("host-serial:{}:forward:{};{}", self.serial, local, remote)
        };
        self.server.execute(&command)
    }

    /// Forward rules belonging to this device. Always asks the server.
    pub fn forward_list(&self) -> Result<Vec<ForwardRule>> {
        let rules = self.server.forward_list()?;
        Ok(rules
            .into_iter()
            .filter(|rule| rule.serial == self.serial.as_str())
            .collect())
    }

    pub fn forward_kill(&self, local_port: u16) -> Result<()> {
        self.forward_kill_spec(&format!("tcp:{}", local_port))
    }

    /// Remove a rule by its raw local spec, as given to [`forward_spec`](Self::forward_spec)
    pub fn forward_kill_spec(&self, local: &str) -> Result<()> {
        self.server
            .execute(&format!("host-serial:{}:killforward:{}", self.serial, local))
    }

    // =========================================================================
    // Device transport commands
    // =========================================================================

    /// Run a shell command and return everything it printed
    pub fn run_shell_command(&self, command: impl Into<ShellCommand>) -> Result<String> {
        let raw = self.run_shell_command_bytes(command)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub fn run_shell_command_bytes(&self, command: impl Into<ShellCommand>) -> Result<Vec<u8>> {
        let service = command.into().service()?;
        self.execute_command(&service, None)
    }

    /// Like [`run_shell_command`](Self::run_shell_command), but `token` can
    /// abort the call from another thread while it waits for output.
    pub fn run_shell_command_cancellable(
        &self,
        command: impl Into<ShellCommand>,
        token: &CancelToken,
    ) -> Result<String> {
        let service = command.into().service()?;
        let raw = self.execute_command(&service, Some(token))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Run a shell command on a blocking task and give up after `timeout`,
    /// closing the socket so the blocked read returns.
    pub async fn run_shell_command_timeout(
        &self,
        command: impl Into<ShellCommand>,
        timeout: Duration,
    ) -> Result<String> {
        let command = command.into();
        let token = CancelToken::new();
        let device = self.clone();
        let task_token = token.clone();

        let task = tokio::task::spawn_blocking(move || {
            device.run_shell_command_cancellable(command, &task_token)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.map_err(|e| AdbError::Io(std::io::Error::other(e)))?,
            Err(_) => {
                warn!("Shell command on {} timed out after {:?}", self.serial, timeout);
                token.cancel();
                Err(AdbError::Timeout { duration: timeout })
            }
        }
    }

    /// Restart adbd on the device listening on TCP `port`
    pub fn enable_adb_over_tcp(&self, port: u16) -> Result<()> {
        self.execute_command_verify_only(&format!("tcpip:{}", port))
    }

    // =========================================================================
    // Sync operations
    // =========================================================================

    pub fn list(&self, remote_path: &str) -> Result<Vec<DeviceFileInfo>> {
        self.with_sync_session(|sync| sync.list(remote_path))
    }

    pub fn stat(&self, remote_path: &str) -> Result<DeviceFileInfo> {
        self.with_sync_session(|sync| sync.stat(remote_path))
    }

    /// Upload `source` to `remote_path`. Returns the number of bytes sent.
    pub fn push<R: Read>(
        &self,
        source: R,
        remote_path: &str,
        modified: DateTime<Utc>,
        mode: u32,
    ) -> Result<u64> {
        let mtime = u32::try_from(modified.timestamp()).map_err(|_| {
            AdbError::invalid_argument(format!(
                "modification time {} does not fit a 32-bit unix timestamp",
                modified
            ))
        })?;
        self.with_sync_session(|sync| sync.send(source, remote_path, mode, mtime))
    }

    /// Upload a local file with mode 0664 and its local modification time
    pub fn push_file(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        info!("Pushing {} to {}", local_path.display(), remote_path);
        let file = File::open(local_path)?;
        let modified: DateTime<Utc> = file.metadata()?.modified()?.into();
        self.push(file, remote_path, modified, DEFAULT_FILE_MODE)
    }

    /// Download `remote_path` into `dest`.
    ///
    /// `dest` is not rolled back on failure; see [`pull_file`](Self::pull_file)
    /// for an all-or-nothing variant.
    pub fn pull<W: Write>(&self, remote_path: &str, dest: W) -> Result<u64> {
        self.with_sync_session(|sync| sync.recv(remote_path, dest))
    }

    /// Download into `local_path`, which is only replaced once the whole file arrived
    pub fn pull_file(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        info!("Pulling {} to {}", remote_path, local_path.display());
        let dir = local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut staging = NamedTempFile::new_in(dir)?;
        let total = self.pull(remote_path, staging.as_file_mut())?;
        staging.persist(local_path).map_err(|e| AdbError::Io(e.error))?;
        Ok(total)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// New connection bound to this device
    fn open_transport(&self, token: Option<&CancelToken>) -> Result<AdbConnection> {
        let mut conn = match token {
            Some(token) => self.server.connect_with_cancel(token)?,
            None => self.server.connect()?,
        };
        conn.bind_to_device(&self.serial)?;
        Ok(conn)
    }

    /// Send one service on a fresh transport and collect the stream until EOF
    fn execute_command(&self, service: &str, token: Option<&CancelToken>) -> Result<Vec<u8>> {
        let mut conn = self.open_transport(token)?;
        let result = conn.execute(service).and_then(|()| conn.read_all());
        conn.close();
        result
    }

    fn execute_command_verify_only(&self, service: &str) -> Result<()> {
        let mut conn = self.open_transport(None)?;
        let result = conn.execute(service);
        conn.close();
        result
    }

    fn with_sync_session<T>(&self, op: impl FnOnce(&mut SyncSession) -> Result<T>) -> Result<T> {
        let mut session = self.open_transport(None)?.into_sync_session()?;
        let result = op(&mut session);
        session.close();
        result
    }
}
