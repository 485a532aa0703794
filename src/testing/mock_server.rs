//! In-process stand-in for the ADB server, speaking the real wire format.
//!
//! Every accepted socket is served on its own thread. Host commands,
//! `host:transport:`, `shell:`, `tcpip:` and the sync sub-protocol are
//! answered from a shared [`MockState`].

use crate::adb::protocol::{read_length_prefixed_string, read_sync_header, sync, MAX_REQUEST_LEN};
use crate::adb::AdbServer;
use crate::config::ClientConfig;
use crate::core::types::{ForwardRule, S_IFDIR, S_IFREG};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Shell command that holds its connection open until the client goes away
pub const HANGING_COMMAND: &str = "sleep forever";

#[derive(Debug, Clone)]
pub struct MockDevice {
    pub serial: String,
    pub state: String,
    pub attrs: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub mode: u32,
    pub mtime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDirEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub devices: Vec<MockDevice>,
    pub files: HashMap<String, MockFile>,
    pub dirs: HashMap<String, Vec<MockDirEntry>>,
    pub shell_responses: HashMap<String, Vec<u8>>,
    pub forwards: Vec<ForwardRule>,
    pub devpath: String,
    /// Every service string received, in order
    pub services: Vec<String>,
    /// Sizes of the DATA packets of the last SEND
    pub send_chunks: Vec<usize>,
    pub tcpip_port: Option<u16>,
    /// When set, the first sync request is answered with these bytes verbatim
    pub raw_sync_reply: Option<Vec<u8>>,
}

impl MockState {
    pub fn with_device(mut self, serial: &str, state: &str, attrs: &str) -> Self {
        self.devices.push(MockDevice {
            serial: serial.to_string(),
            state: state.to_string(),
            attrs: attrs.to_string(),
        });
        self
    }

    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                mode: S_IFREG | 0o644,
                mtime: 1_700_000_000,
            },
        );
        self
    }

    pub fn with_dir(mut self, path: &str, entries: Vec<MockDirEntry>) -> Self {
        self.dirs.insert(path.to_string(), entries);
        self
    }

    pub fn with_shell_response(mut self, command: &str, output: &[u8]) -> Self {
        self.shell_responses
            .insert(command.to_string(), output.to_vec());
        self
    }

    pub fn with_forward(mut self, serial: &str, local: &str, remote: &str) -> Self {
        self.forwards.push(ForwardRule {
            serial: serial.to_string(),
            local: local.to_string(),
            remote: remote.to_string(),
        });
        self
    }

    pub fn with_raw_sync_reply(mut self, bytes: Vec<u8>) -> Self {
        self.raw_sync_reply = Some(bytes);
        self
    }

    fn device(&self, serial: &str) -> Option<&MockDevice> {
        self.devices.iter().find(|d| d.serial == serial)
    }
}

pub struct MockAdbServer {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockAdbServer {
    pub fn start(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || handle_connection(stream, conn_state));
            }
        });

        Self { addr, state }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn server(&self) -> AdbServer {
        AdbServer::new(self.config())
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

/// A port nobody listens on
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_okay(stream: &mut TcpStream) {
    let _ = stream.write_all(b"OKAY");
}

fn write_framed(stream: &mut TcpStream, payload: &str) {
    let _ = stream.write_all(format!("{:04x}{}", payload.len(), payload).as_bytes());
}

fn write_fail(stream: &mut TcpStream, message: &str) {
    let _ = stream.write_all(b"FAIL");
    write_framed(stream, message);
}

fn handle_connection(mut stream: TcpStream, state: Arc<Mutex<MockState>>) {
    let mut bound = false;

    loop {
        let Ok(service) = read_length_prefixed_string(&mut stream) else {
            return;
        };
        state.lock().unwrap().services.push(service.clone());

        if let Some(serial) = service.strip_prefix("host:transport:") {
            let online = state
                .lock()
                .unwrap()
                .device(serial)
                .is_some_and(|d| d.state == "device");
            if online {
                write_okay(&mut stream);
                bound = true;
                continue;
            }
            write_fail(&mut stream, &format!("device '{}' not found", serial));
            return;
        }

        if let Some(rest) = service.strip_prefix("host-serial:") {
            handle_host_serial(&mut stream, &state, rest);
            return;
        }

        match service.as_str() {
            "host:version" => {
                write_okay(&mut stream);
                write_framed(&mut stream, "0029");
            }
            "host:devices-l" => {
                let listing: String = state
                    .lock()
                    .unwrap()
                    .devices
                    .iter()
                    .map(|d| format!("{:<22} {} {}\n", d.serial, d.state, d.attrs))
                    .collect();
                write_okay(&mut stream);
                write_framed(&mut stream, &listing);
            }
            "host:list-forward" => {
                let listing: String = state
                    .lock()
                    .unwrap()
                    .forwards
                    .iter()
                    .map(|f| format!("{} {} {}\n", f.serial, f.local, f.remote))
                    .collect();
                write_okay(&mut stream);
                write_framed(&mut stream, &listing);
            }
            "sync:" if bound => {
                write_okay(&mut stream);
                handle_sync(&mut stream, &state);
            }
            s if bound && s.starts_with("shell:") => {
                handle_shell(&mut stream, &state, &s["shell:".len()..]);
            }
            s if bound && s.starts_with("tcpip:") => {
                let port = &s["tcpip:".len()..];
                state.lock().unwrap().tcpip_port = port.parse().ok();
                write_okay(&mut stream);
                let _ = stream.write_all(format!("restarting in TCP mode port: {}\n", port).as_bytes());
            }
            _ => write_fail(&mut stream, &format!("unknown host service '{}'", service)),
        }
        return;
    }
}

fn handle_host_serial(stream: &mut TcpStream, state: &Arc<Mutex<MockState>>, rest: &str) {
    let mut state = state.lock().unwrap();

    // Serials may contain ':' themselves, so match against known devices.
    let Some((serial, command)) = state
        .devices
        .iter()
        .find_map(|d| {
            rest.strip_prefix(d.serial.as_str())
                .and_then(|r| r.strip_prefix(':'))
                .map(|command| (d.serial.clone(), command.to_string()))
        })
    else {
        write_fail(stream, "device not found");
        return;
    };

    if command == "get-state" {
        let device_state = state.device(&serial).map(|d| d.state.clone()).unwrap_or_default();
        write_okay(stream);
        write_framed(stream, &device_state);
    } else if command == "get-devpath" {
        let devpath = state.devpath.clone();
        write_okay(stream);
        write_framed(stream, &devpath);
    } else if let Some(spec) = command.strip_prefix("forward:") {
        let (no_rebind, spec) = match spec.strip_prefix("norebind:") {
            Some(spec) => (true, spec),
            None => (false, spec),
        };
        let Some((local, remote)) = spec.split_once(';') else {
            write_fail(stream, "malformed forward spec");
            return;
        };
        let existing = state.forwards.iter().position(|f| f.local == local);
        match existing {
            Some(_) if no_rebind => {
                write_fail(stream, "cannot rebind existing socket");
                return;
            }
            Some(index) => {
                state.forwards.remove(index);
            }
            None => {}
        }
        state.forwards.push(ForwardRule {
            serial,
            local: local.to_string(),
            remote: remote.to_string(),
        });
        write_okay(stream);
        write_okay(stream);
    } else if let Some(local) = command.strip_prefix("killforward:") {
        match state.forwards.iter().position(|f| f.local == local) {
            Some(index) => {
                state.forwards.remove(index);
                write_okay(stream);
                write_okay(stream);
            }
            None => write_fail(stream, &format!("listener '{}' not found", local)),
        }
    } else {
        write_fail(stream, &format!("unsupported command '{}'", command));
    }
}

fn handle_shell(stream: &mut TcpStream, state: &Arc<Mutex<MockState>>, command: &str) {
    write_okay(stream);
    if command == HANGING_COMMAND {
        // Hold the socket until the client shuts it down.
        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
        return;
    }

    let output = state
        .lock()
        .unwrap()
        .shell_responses
        .get(command)
        .cloned()
        .unwrap_or_else(|| format!("/system/bin/sh: {}: inaccessible or not found\n", command).into_bytes());
    // Large outputs go out in pieces, the way a real shell streams.
    for piece in output.chunks(1000) {
        let _ = stream.write_all(piece);
    }
}

fn read_payload(stream: &mut TcpStream, len: u32) -> Option<Vec<u8>> {
    if len as usize > MAX_REQUEST_LEN.max(sync::MAX_DATA) {
        return None;
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).ok()?;
    Some(buf)
}

fn write_sync(stream: &mut TcpStream, tag: &[u8; 4], words: &[u32], payload: &[u8]) {
    let mut out = tag.to_vec();
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(payload);
    let _ = stream.write_all(&out);
}

fn write_sync_fail(stream: &mut TcpStream, message: &str) {
    write_sync(stream, &sync::FAIL, &[message.len() as u32], message.as_bytes());
}

fn handle_sync(stream: &mut TcpStream, state: &Arc<Mutex<MockState>>) {
    loop {
        let Ok((tag, len)) = read_sync_header(stream) else {
            return;
        };
        let Some(payload) = read_payload(stream, len) else {
            return;
        };
        let path = String::from_utf8_lossy(&payload).into_owned();

        let raw = state.lock().unwrap().raw_sync_reply.take();
        if let Some(raw) = raw {
            let _ = stream.write_all(&raw);
            return;
        }

        match tag {
            sync::LIST => {
                let entries = state.lock().unwrap().dirs.get(&path).cloned().unwrap_or_default();
                for entry in entries {
                    write_sync(
                        stream,
                        &sync::DENT,
                        &[entry.mode, entry.size, entry.mtime, entry.name.len() as u32],
                        entry.name.as_bytes(),
                    );
                }
                write_sync(stream, &sync::DONE, &[0, 0, 0, 0], &[]);
            }
            sync::STAT => {
                let state = state.lock().unwrap();
                let (mode, size, mtime) = if let Some(file) = state.files.get(&path) {
                    (file.mode, file.data.len() as u32, file.mtime)
                } else if state.dirs.contains_key(&path) {
                    (S_IFDIR | 0o755, 4096, 1_700_000_000)
                } else {
                    (0, 0, 0)
                };
                write_sync(stream, &sync::STAT, &[mode, size, mtime], &[]);
            }
            sync::SEND => {
                let Some((target, mode)) = path.rsplit_once(',') else {
                    write_sync_fail(stream, "missing mode");
                    return;
                };
                let mode: u32 = mode.parse().unwrap_or(0);
                let mut data = Vec::new();
                let mut chunks = Vec::new();
                let mtime = loop {
                    let Ok((tag, len)) = read_sync_header(stream) else {
                        return;
                    };
                    match tag {
                        sync::DATA => {
                            let Some(chunk) = read_payload(stream, len) else {
                                return;
                            };
                            chunks.push(chunk.len());
                            data.extend_from_slice(&chunk);
                        }
                        sync::DONE => break len,
                        _ => return,
                    }
                };

                let mut state = state.lock().unwrap();
                state.send_chunks = chunks;
                if target.starts_with("/system/") {
                    write_sync_fail(stream, "couldn't create file: Read-only file system");
                    continue;
                }
                state.files.insert(
                    target.to_string(),
                    MockFile {
                        data,
                        mode: S_IFREG | mode,
                        mtime,
                    },
                );
                write_sync(stream, &sync::OKAY, &[0], &[]);
            }
            sync::RECV => {
                let file = state.lock().unwrap().files.get(&path).cloned();
                match file {
                    Some(file) => {
                        for chunk in file.data.chunks(sync::MAX_DATA) {
                            write_sync(stream, &sync::DATA, &[chunk.len() as u32], chunk);
                        }
                        write_sync(stream, &sync::DONE, &[0], &[]);
                    }
                    None => write_sync_fail(stream, "open failed: No such file or directory"),
                }
            }
            _ => return,
        }
    }
}
