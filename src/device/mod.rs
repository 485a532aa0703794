pub mod session;

pub use session::{Device, DEFAULT_ADBD_TCP_PORT, DEFAULT_FILE_MODE};
