use crate::adb::file_transfer::SyncSession;
use crate::adb::protocol;
use crate::config::ClientConfig;
use crate::core::types::DeviceId;
use crate::error::{AdbError, Result};
use log::*;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const BUFFER_SIZE: usize = 4096;

/// A single TCP session to the ADB server.
///
/// Fresh connections speak to the server's host dispatcher. After
/// [`bind_to_device`](Self::bind_to_device) every further service on the
/// socket is handled by that device; after
/// [`into_sync_session`](Self::into_sync_session) the socket only carries
/// sync packets. Neither upgrade can be undone. The socket is closed when
/// the connection is dropped, and so is its entry in any [`CancelToken`].
pub struct AdbConnection {
    stream: TcpStream,
    device_id: Option<DeviceId>,
    cancel: Option<Registration>,
}

impl AdbConnection {
    /// Connect to the ADB server. No bytes are exchanged until the first `send`.
    pub fn open(config: &ClientConfig) -> Result<Self> {
        Self::open_inner(config, None)
    }

    /// Connect and register the socket with `token`, so another thread can
    /// tear it down while this one is blocked.
    pub fn open_with_cancel(config: &ClientConfig, token: &CancelToken) -> Result<Self> {
        Self::open_inner(config, Some(token.clone()))
    }

    fn open_inner(config: &ClientConfig, cancel: Option<CancelToken>) -> Result<Self> {
        let address = config.address();
        debug!("Connecting to ADB server at {}", address);

        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(cancelled());
        }

        let stream = establish_connection(&address).map_err(|source| AdbError::Connect {
            address: address.clone(),
            source,
        })?;
        stream.set_read_timeout(config.io_timeout())?;
        stream.set_write_timeout(config.io_timeout())?;
        debug!("Connection established");

        let cancel = match cancel {
            Some(token) => Some(token.register(&stream)?),
            None => None,
        };

        Ok(Self {
            stream,
            device_id: None,
            cancel,
        })
    }

    /// Write one framed service request without waiting for the reply
    pub fn send(&mut self, service: &str) -> Result<()> {
        debug!("Sending service request: {}", service);
        let frame = protocol::encode_request(service)?;
        self.stream.write_all(&frame).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Read the OKAY/FAIL status of the last request.
    ///
    /// On OKAY the socket is positioned at whatever the service sends next.
    pub fn verify_response(&mut self) -> Result<()> {
        let result = protocol::read_status(&mut self.stream);
        match &result {
            Ok(()) => debug!("Response: OKAY"),
            Err(e) => debug!("Response: {}", e),
        }
        result.map_err(|e| self.check_cancelled(e))
    }

    /// Send a request and check its status
    pub fn execute(&mut self, service: &str) -> Result<()> {
        self.send(service)?;
        self.verify_response()
    }

    /// Drain the socket until the server closes it.
    ///
    /// Used for `shell:` output, which has no length prefix. Blocks until the
    /// remote process exits unless the connection is cancelled.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => {
                    debug!("Server closed the connection after {} bytes", output.len());
                    break;
                }
                Ok(n) => output.extend_from_slice(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            }
        }

        // A shut-down socket reads as EOF; don't pass a cut-off stream as complete output.
        if self.is_cancelled() {
            return Err(cancelled());
        }
        Ok(output)
    }

    /// Read a hex-length-prefixed reply, as sent by host query commands
    pub fn read_length_prefixed_string(&mut self) -> Result<String> {
        protocol::read_length_prefixed_string(&mut self.stream).map_err(|e| self.check_cancelled(e))
    }

    /// Dedicate this socket to one device via `host:transport:<serial>`
    pub fn bind_to_device(&mut self, device_id: &DeviceId) -> Result<()> {
        if let Some(bound) = &self.device_id {
            return Err(AdbError::invalid_argument(format!(
                "connection is already bound to {}",
                bound
            )));
        }
        self.execute(&format!("host:transport:{}", device_id.as_str()))?;
        self.device_id = Some(device_id.clone());
        Ok(())
    }

    /// Switch a device-bound connection into the sync sub-protocol.
    ///
    /// Consumes the connection: the socket can never carry another host
    /// command afterwards.
    pub fn into_sync_session(mut self) -> Result<SyncSession> {
        if self.device_id.is_none() {
            return Err(AdbError::invalid_argument(
                "sync: requires a device-bound connection",
            ));
        }
        self.execute("sync:")?;
        Ok(SyncSession::new(self))
    }

    /// Close the socket in both directions
    pub fn close(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("Shutdown on close failed: {}", e);
        }
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    pub(crate) fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|registration| registration.token.is_cancelled())
    }

    /// Map an error produced after a cancel to the cancellation itself
    pub(crate) fn check_cancelled(&self, err: AdbError) -> AdbError {
        if self.is_cancelled() {
            cancelled()
        } else {
            err
        }
    }

    fn io_error(&self, err: io::Error) -> AdbError {
        self.check_cancelled(AdbError::Io(err))
    }
}

fn establish_connection(address: &str) -> io::Result<TcpStream> {
    let resolved = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve address"))?;
    debug!("Resolved address: {:?}", resolved);
    TcpStream::connect(resolved)
}

fn cancelled() -> AdbError {
    AdbError::Io(io::Error::new(io::ErrorKind::Interrupted, "operation cancelled"))
}

/// Tears down the sockets of in-flight operations from another thread.
///
/// Pass a token to an operation, keep a clone, and call [`cancel`](Self::cancel)
/// to make every blocked read or write on the registered sockets return.
/// A token cancelled before the connection opens makes the open fail.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    sockets: Mutex<Vec<(u64, TcpStream)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let sockets = self.sockets();
        debug!("Cancelling {} ADB socket(s)", sockets.len());
        for (_, socket) in sockets.iter() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                trace!("Shutdown on cancel failed: {}", e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Number of live connections currently registered
    pub fn registered(&self) -> usize {
        self.sockets().len()
    }

    fn sockets(&self) -> MutexGuard<'_, Vec<(u64, TcpStream)>> {
        self.inner
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, stream: &TcpStream) -> Result<Registration> {
        let mut sockets = self.sockets();
        // Checked under the lock so a concurrent cancel() sees either the flag or the socket.
        if self.is_cancelled() {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(cancelled());
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        sockets.push((id, stream.try_clone()?));
        Ok(Registration {
            token: self.clone(),
            id,
        })
    }

    fn deregister(&self, id: u64) {
        self.sockets().retain(|(registered, _)| *registered != id);
    }
}

/// A connection's slot in a [`CancelToken`]; the cloned socket is released on drop
struct Registration {
    token: CancelToken,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token.deregister(self.id);
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
