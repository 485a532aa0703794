pub mod connection;
pub mod file_transfer;
pub mod protocol;
pub mod server;
pub mod shell;

pub use connection::{AdbConnection, CancelToken};
pub use file_transfer::SyncSession;
pub use protocol::SyncPacket;
pub use server::AdbServer;
pub use shell::ShellCommand;

// Re-export commonly used types
pub use crate::error::Result;
