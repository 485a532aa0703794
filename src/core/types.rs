use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// File type constants (from stat.h)
// =============================================================================

pub const S_IFMT: u32 = 0o170000; // bit mask for the file type bit field
pub const S_IFSOCK: u32 = 0o140000; // socket
pub const S_IFLNK: u32 = 0o120000; // symbolic link
pub const S_IFREG: u32 = 0o100000; // regular file
pub const S_IFBLK: u32 = 0o060000; // block device
pub const S_IFDIR: u32 = 0o040000; // directory
pub const S_IFCHR: u32 = 0o020000; // character device
pub const S_IFIFO: u32 = 0o010000; // FIFO

/// Strongly typed device serial
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Device state as reported by `get-state` or `devices-l`.
///
/// The mapping from server strings is lossy: anything unrecognised becomes
/// `Unknown`, and an empty string means the server no longer sees the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Disconnected,
    Unknown,
}

impl DeviceState {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Unknown => "unknown",
        }
    }
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s.trim() {
            "" => DeviceState::Disconnected,
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A port-forward rule owned by the ADB server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub serial: String,
    pub local: String,
    pub remote: String,
}

impl ForwardRule {
    /// Parse one `host:list-forward` line: `<serial> <local> <remote>`
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let rule = Self {
            serial: fields.next()?.to_string(),
            local: fields.next()?.to_string(),
            remote: fields.next()?.to_string(),
        };
        Some(rule)
    }
}

/// One entry of a remote directory listing (or a STAT reply)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFileInfo {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub last_modified: DateTime<Utc>,
}

impl DeviceFileInfo {
    pub fn new(name: impl Into<String>, mode: u32, size: u32, mtime: u32) -> Self {
        Self {
            name: name.into(),
            mode,
            size,
            last_modified: DateTime::from_timestamp(i64::from(mtime), 0).unwrap_or_default(),
        }
    }

    /// Directory-ness comes from the mode bits only
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn mtime(&self) -> u32 {
        u32::try_from(self.last_modified.timestamp()).unwrap_or(0)
    }

    pub fn file_type(&self) -> &'static str {
        match self.mode & S_IFMT {
            S_IFIFO => "Named pipe (fifo)",
            S_IFCHR => "Character device",
            S_IFDIR => "Directory",
            S_IFBLK => "Block device",
            S_IFREG => "Regular file",
            S_IFLNK => "Symbolic link",
            S_IFSOCK => "Socket",
            _ => "Unknown",
        }
    }

    /// `ls -l` style permission string, e.g. `drwxr-x--x`
    pub fn permissions_string(&self) -> String {
        let mode = self.mode;
        let file_type = match mode & S_IFMT {
            S_IFIFO => 'p',
            S_IFCHR => 'c',
            S_IFDIR => 'd',
            S_IFBLK => 'b',
            S_IFREG => '-',
            S_IFLNK => 'l',
            S_IFSOCK => 's',
            _ => '?',
        };

        let mut out = String::with_capacity(10);
        out.push(file_type);
        out.push_str(&permission_triplet(mode >> 6, mode & 0o4000 != 0, 's'));
        out.push_str(&permission_triplet(mode >> 3, mode & 0o2000 != 0, 's'));
        out.push_str(&permission_triplet(mode, mode & 0o1000 != 0, 't'));
        out
    }
}

fn permission_triplet(bits: u32, special: bool, special_char: char) -> String {
    let mut triplet = String::with_capacity(3);
    triplet.push(if bits & 4 != 0 { 'r' } else { '-' });
    triplet.push(if bits & 2 != 0 { 'w' } else { '-' });
    triplet.push(match (bits & 1 != 0, special) {
        (false, false) => '-',
        (true, false) => 'x',
        (false, true) => special_char.to_ascii_uppercase(),
        (true, true) => special_char,
    });
    triplet
}
