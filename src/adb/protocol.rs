//! Wire framing for the ADB server protocol.
//!
//! Host commands are framed as four lowercase hex digits giving the byte
//! length, followed by the UTF-8 service string. Replies start with a
//! four-byte status, `OKAY` or `FAIL`; `FAIL` carries a hex-length-prefixed
//! message.
//!
//! Once a transport has been switched to `sync:`, traffic becomes binary
//! packets: a four-byte ASCII tag, a little-endian `u32` and (for most
//! tags) that many payload bytes.

use crate::error::{AdbError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};

/// Largest service string the 4-hex-digit length field can describe
pub const MAX_REQUEST_LEN: usize = 0xffff;

pub const OKAY: &[u8; 4] = b"OKAY";
pub const FAIL: &[u8; 4] = b"FAIL";

/// Sync protocol packet tags
pub mod sync {
    pub const STAT: [u8; 4] = *b"STAT";
    pub const LIST: [u8; 4] = *b"LIST";
    pub const DENT: [u8; 4] = *b"DENT";
    pub const SEND: [u8; 4] = *b"SEND";
    pub const RECV: [u8; 4] = *b"RECV";
    pub const DATA: [u8; 4] = *b"DATA";
    pub const DONE: [u8; 4] = *b"DONE";
    pub const OKAY: [u8; 4] = *b"OKAY";
    pub const FAIL: [u8; 4] = *b"FAIL";

    /// Largest DATA payload either side may put in one packet
    pub const MAX_DATA: usize = 64 * 1024;
    /// Longest remote path adbd accepts
    pub const MAX_PATH: usize = 1024;
}

// =============================================================================
// Host command framing
// =============================================================================

/// Frame a service string as `hex4(len) + bytes`
pub fn encode_request(service: &str) -> Result<Bytes> {
    let bytes = service.as_bytes();
    if bytes.len() > MAX_REQUEST_LEN {
        return Err(AdbError::invalid_argument(format!(
            "service request is {} bytes, the protocol allows at most {}",
            bytes.len(),
            MAX_REQUEST_LEN
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + bytes.len());
    buf.put_slice(format!("{:04x}", bytes.len()).as_bytes());
    buf.put_slice(bytes);
    Ok(buf.freeze())
}

/// Parse a four-character hex length field, accepting either case
pub fn decode_hex_length(field: &[u8; 4]) -> Result<usize> {
    if !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(AdbError::protocol(format!(
            "invalid hex length field {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    // All four bytes are ASCII hex digits, so both conversions succeed.
    let text = std::str::from_utf8(field).map_err(|e| AdbError::protocol(e.to_string()))?;
    usize::from_str_radix(text, 16).map_err(|e| AdbError::protocol(e.to_string()))
}

/// Read exactly `buf.len()` bytes of a framed field.
///
/// Running out of stream here means the peer sent a truncated frame, which
/// is a protocol fault rather than a plain I/O failure.
pub fn read_framed<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            AdbError::protocol(format!("truncated {}", what))
        } else {
            AdbError::Io(e)
        }
    })
}

/// Read a hex-length-prefixed payload (FAIL messages, host query replies)
pub fn read_length_prefixed<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_field = [0u8; 4];
    read_framed(reader, &mut len_field, "length field")?;
    let len = decode_hex_length(&len_field)?;

    let mut payload = vec![0u8; len];
    read_framed(reader, &mut payload, "length-prefixed payload")?;
    Ok(payload)
}

pub fn read_length_prefixed_string<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let payload = read_length_prefixed(reader)?;
    String::from_utf8(payload)
        .map_err(|e| AdbError::protocol(format!("payload is not UTF-8: {}", e)))
}

/// Read a 4-byte status. `OKAY` returns `Ok`, `FAIL` becomes `AdbError::Remote`.
pub fn read_status<R: Read + ?Sized>(reader: &mut R) -> Result<()> {
    let mut status = [0u8; 4];
    read_framed(reader, &mut status, "status")?;

    match &status {
        OKAY => Ok(()),
        FAIL => {
            let message = read_length_prefixed(reader)?;
            Err(AdbError::Remote(String::from_utf8_lossy(&message).into_owned()))
        }
        _ => Err(AdbError::protocol(format!(
            "expected OKAY or FAIL, got {:?}",
            String::from_utf8_lossy(&status)
        ))),
    }
}

// =============================================================================
// Sync packets
// =============================================================================

/// One sync protocol packet: tag, little-endian length, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPacket {
    pub id: [u8; 4],
    pub length: u32,
    pub payload: Bytes,
}

impl SyncPacket {
    pub fn new(id: [u8; 4], payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let length = u32::try_from(payload.len())
            .map_err(|_| AdbError::invalid_argument("sync payload exceeds u32::MAX"))?;
        Ok(Self { id, length, payload })
    }

    /// A packet whose length field carries a value and no payload follows,
    /// as in the `DONE <mtime>` terminator of SEND.
    pub fn status(id: [u8; 4], value: u32) -> Self {
        Self {
            id,
            length: value,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.put_slice(&self.id);
        buf.put_u32_le(self.length);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Read a header and exactly `length` payload bytes, refusing payloads
    /// larger than `max_payload`.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, max_payload: usize) -> Result<Self> {
        let (id, length) = read_sync_header(reader)?;
        let len = length as usize;
        if len > max_payload {
            return Err(AdbError::protocol(format!(
                "{} packet of {} bytes exceeds the {} byte limit",
                tag_name(&id),
                len,
                max_payload
            )));
        }

        let mut payload = vec![0u8; len];
        read_framed(reader, &mut payload, "sync payload")?;
        Ok(Self {
            id,
            length,
            payload: Bytes::from(payload),
        })
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Read the 8-byte `tag | u32 LE` header of a sync packet
pub fn read_sync_header<R: Read + ?Sized>(reader: &mut R) -> Result<([u8; 4], u32)> {
    let mut header = [0u8; 8];
    read_framed(reader, &mut header, "sync packet header")?;
    let id = [header[0], header[1], header[2], header[3]];
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    Ok((id, length))
}

pub fn read_u32_le<R: Read + ?Sized>(reader: &mut R, what: &str) -> Result<u32> {
    let mut word = [0u8; 4];
    read_framed(reader, &mut word, what)?;
    Ok(u32::from_le_bytes(word))
}

/// Printable form of a tag for error messages
pub fn tag_name(id: &[u8; 4]) -> String {
    if id.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(id).into_owned()
    } else {
        format!("{:02x?}", id)
    }
}
