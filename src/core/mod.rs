pub mod types;

pub use types::{DeviceFileInfo, DeviceId, DeviceState, ForwardRule};
