use crate::adb::connection::AdbConnection;
use crate::adb::protocol::{
    self, read_framed, read_sync_header, read_u32_le, sync, tag_name, SyncPacket,
};
use crate::core::types::DeviceFileInfo;
use crate::error::{AdbError, Result};
use bytes::{BufMut, BytesMut};
use log::*;
use std::io::{self, Read, Write};

/// A device-bound connection that has switched to the binary sync protocol.
///
/// LIST, STAT, SEND and RECV each run to completion before the next one may
/// start. A failed operation leaves the stream in an unknown position, so
/// the session should be dropped rather than reused.
pub struct SyncSession {
    conn: AdbConnection,
}

impl SyncSession {
    pub(crate) fn new(conn: AdbConnection) -> Self {
        Self { conn }
    }

    /// List a remote directory. Entries come back in the order the device
    /// sends them; a missing or empty directory yields an empty list.
    pub fn list(&mut self, remote_path: &str) -> Result<Vec<DeviceFileInfo>> {
        debug!("LIST {}", remote_path);
        self.send_request(sync::LIST, remote_path)?;

        let mut entries = Vec::new();
        loop {
            let mut tag = [0u8; 4];
            read_framed(self.conn.stream(), &mut tag, "directory entry")
                .map_err(|e| self.conn.check_cancelled(e))?;

            match tag {
                sync::DENT => {
                    let entry = self.read_dent_body()?;
                    trace!("DENT {:o} {} {}", entry.mode, entry.size, entry.name);
                    entries.push(entry);
                }
                sync::DONE => {
                    // DONE reuses the DENT layout with every field zeroed
                    let mut unused = [0u8; 16];
                    read_framed(self.conn.stream(), &mut unused, "LIST terminator")?;
                    break;
                }
                sync::FAIL => return Err(self.read_fail_message()?),
                other => {
                    return Err(AdbError::protocol(format!(
                        "unexpected {} packet in directory listing",
                        tag_name(&other)
                    )))
                }
            }
        }

        debug!("LIST {} returned {} entries", remote_path, entries.len());
        Ok(entries)
    }

    /// Stat a remote path. adbd answers a missing path with an all-zero reply.
    pub fn stat(&mut self, remote_path: &str) -> Result<DeviceFileInfo> {
        debug!("STAT {}", remote_path);
        self.send_request(sync::STAT, remote_path)?;

        let mut tag = [0u8; 4];
        read_framed(self.conn.stream(), &mut tag, "STAT reply")?;
        match tag {
            sync::STAT => {}
            sync::FAIL => return Err(self.read_fail_message()?),
            other => {
                return Err(AdbError::protocol(format!(
                    "expected STAT reply, got {}",
                    tag_name(&other)
                )))
            }
        }

        let stream = self.conn.stream();
        let mode = read_u32_le(stream, "STAT mode")?;
        let size = read_u32_le(stream, "STAT size")?;
        let mtime = read_u32_le(stream, "STAT mtime")?;
        if mode == 0 && size == 0 && mtime == 0 {
            return Err(AdbError::Remote(format!(
                "{}: No such file or directory",
                remote_path
            )));
        }
        Ok(DeviceFileInfo::new(remote_path, mode, size, mtime))
    }

    /// Stream `source` to `remote_path` and commit it with `mode` and `mtime`.
    ///
    /// Returns the number of bytes sent.
    pub fn send<R: Read>(
        &mut self,
        mut source: R,
        remote_path: &str,
        mode: u32,
        mtime: u32,
    ) -> Result<u64> {
        debug!("SEND {} mode={:o} mtime={}", remote_path, mode, mtime);
        // adbd applies the path limit to the whole "<path>,<mode>" request
        let header = format!("{},{}", remote_path, mode);
        validate_path(&header)?;
        self.write_packet(&SyncPacket::new(sync::SEND, header)?)?;

        let mut buffer = vec![0u8; sync::MAX_DATA];
        let mut frame = BytesMut::with_capacity(8 + sync::MAX_DATA);
        let mut total = 0u64;
        loop {
            let n = fill_chunk(&mut source, &mut buffer)?;
            if n == 0 {
                break;
            }
            trace!("DATA {} bytes", n);
            frame.clear();
            frame.put_slice(&sync::DATA);
            frame.put_u32_le(n as u32);
            frame.put_slice(&buffer[..n]);
            self.write_frame(&frame)?;
            total += n as u64;
        }

        // The terminator's length field carries the modification time.
        self.write_packet(&SyncPacket::status(sync::DONE, mtime))?;
        self.read_send_status()?;

        debug!("SEND {} complete, {} bytes", remote_path, total);
        Ok(total)
    }

    /// Copy `remote_path` into `dest`, returning the number of bytes written.
    ///
    /// On failure `dest` holds whatever arrived before the error; callers that
    /// need all-or-nothing should write to a temporary file and rename it.
    pub fn recv<W: Write>(&mut self, remote_path: &str, mut dest: W) -> Result<u64> {
        debug!("RECV {}", remote_path);
        self.send_request(sync::RECV, remote_path)?;

        let mut total = 0u64;
        loop {
            let (id, length) =
                read_sync_header(self.conn.stream()).map_err(|e| self.conn.check_cancelled(e))?;
            match id {
                sync::DATA => {
                    let len = length as usize;
                    if len > sync::MAX_DATA {
                        return Err(AdbError::protocol(format!(
                            "DATA packet of {} bytes exceeds the {} byte limit",
                            len,
                            sync::MAX_DATA
                        )));
                    }
                    let mut chunk = vec![0u8; len];
                    read_framed(self.conn.stream(), &mut chunk, "DATA payload")
                        .map_err(|e| self.conn.check_cancelled(e))?;
                    dest.write_all(&chunk)?;
                    total += len as u64;
                    trace!("DATA {} bytes (total {})", len, total);
                }
                sync::DONE => break,
                sync::FAIL => return Err(self.read_message(length)?),
                other => {
                    return Err(AdbError::protocol(format!(
                        "unexpected {} packet while receiving {}",
                        tag_name(&other),
                        remote_path
                    )))
                }
            }
        }

        dest.flush()?;
        debug!("RECV {} complete, {} bytes", remote_path, total);
        Ok(total)
    }

    /// Close the underlying socket
    pub fn close(self) {
        self.conn.close();
    }

    fn send_request(&mut self, id: [u8; 4], remote_path: &str) -> Result<()> {
        validate_path(remote_path)?;
        self.write_packet(&SyncPacket::new(id, remote_path.to_owned())?)
    }

    fn write_packet(&mut self, packet: &SyncPacket) -> Result<()> {
        self.write_frame(&packet.encode())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self.conn.stream().write_all(frame) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover_write_failure(e)),
        }
    }

    /// adbd reports errors such as a read-only destination by sending FAIL
    /// and closing, which shows up here as a broken pipe. Prefer its message.
    fn recover_write_failure(&mut self, err: io::Error) -> AdbError {
        let peer_closed = matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        );
        if !peer_closed || self.conn.is_cancelled() {
            return self.conn.check_cancelled(AdbError::Io(err));
        }
        match SyncPacket::read_from(self.conn.stream(), protocol::MAX_REQUEST_LEN) {
            Ok(packet) if packet.id == sync::FAIL => AdbError::Remote(packet.payload_str()),
            _ => AdbError::Io(err),
        }
    }

    fn read_send_status(&mut self) -> Result<()> {
        let (id, length) =
            read_sync_header(self.conn.stream()).map_err(|e| self.conn.check_cancelled(e))?;
        match id {
            sync::OKAY => Ok(()),
            sync::FAIL => Err(self.read_message(length)?),
            other => Err(AdbError::protocol(format!(
                "expected OKAY or FAIL after SEND, got {}",
                tag_name(&other)
            ))),
        }
    }

    fn read_dent_body(&mut self) -> Result<DeviceFileInfo> {
        let stream = self.conn.stream();
        let mode = read_u32_le(stream, "DENT mode")?;
        let size = read_u32_le(stream, "DENT size")?;
        let mtime = read_u32_le(stream, "DENT mtime")?;
        let name_len = read_u32_le(stream, "DENT name length")? as usize;
        if name_len > sync::MAX_PATH {
            return Err(AdbError::protocol(format!(
                "DENT name length {} exceeds {}",
                name_len,
                sync::MAX_PATH
            )));
        }

        let mut name = vec![0u8; name_len];
        read_framed(stream, &mut name, "DENT name")?;
        let name = String::from_utf8(name)
            .map_err(|e| AdbError::protocol(format!("DENT name is not UTF-8: {}", e)))?;
        Ok(DeviceFileInfo::new(name, mode, size, mtime))
    }

    /// FAIL whose length word has not been read yet
    fn read_fail_message(&mut self) -> Result<AdbError> {
        let length = read_u32_le(self.conn.stream(), "FAIL length")?;
        self.read_message(length)
    }

    fn read_message(&mut self, length: u32) -> Result<AdbError> {
        let len = length as usize;
        if len > protocol::MAX_REQUEST_LEN {
            return Err(AdbError::protocol(format!("FAIL message of {} bytes", len)));
        }
        let mut message = vec![0u8; len];
        read_framed(self.conn.stream(), &mut message, "FAIL message")?;
        let message = String::from_utf8_lossy(&message).into_owned();
        debug!("Sync FAIL: {}", message);
        Ok(AdbError::Remote(message))
    }
}

/// Check a LIST/STAT/RECV path or a SEND `<path>,<mode>` request against adbd's limit
fn validate_path(request: &str) -> Result<()> {
    if request.len() > sync::MAX_PATH {
        return Err(AdbError::invalid_argument(format!(
            "remote path request is {} bytes, adbd accepts at most {}",
            request.len(),
            sync::MAX_PATH
        )));
    }
    Ok(())
}

/// Read until `buf` is full or the source hits EOF
fn fill_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
