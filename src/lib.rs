//! Client for the ADB server's host protocol.
//!
//! [`AdbServer`] talks to the server's host dispatcher and hands out
//! [`Device`] sessions. Each device operation opens its own connection,
//! binds it to the device's transport and closes it when done.

pub mod adb;
pub mod config;
pub mod core;
pub mod device;
pub mod error;

pub use adb::{AdbConnection, AdbServer, CancelToken, ShellCommand, SyncSession};
pub use config::ClientConfig;
pub use crate::core::types::{DeviceFileInfo, DeviceId, DeviceState, ForwardRule};
pub use device::Device;
pub use error::{AdbError, Result};

#[cfg(test)]
pub mod testing;
