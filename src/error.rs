use std::time::Duration;
use thiserror::Error;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, AdbError>;

/// Everything that can go wrong while talking to an ADB server
#[derive(Debug, Error)]
pub enum AdbError {
    /// The TCP connection to the ADB server could not be established
    #[error("cannot connect to ADB server at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed framing: bad hex length, truncated packet, unexpected sync tag
    #[error("ADB protocol error: {0}")]
    Protocol(String),

    /// The server answered FAIL; the message is passed through verbatim
    #[error("{0}")]
    Remote(String),

    /// Underlying stream read/write failure
    #[error("ADB connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-supplied data violates a precondition
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A deadline wrapper gave up on the operation and tore the socket down
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("config error: {0}")]
    Config(String),
}

impl AdbError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        AdbError::Protocol(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        AdbError::InvalidArgument(msg.into())
    }

    /// Message reported by the server, if this is a remote failure
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            AdbError::Remote(msg) => Some(msg),
            _ => None,
        }
    }
}
