//! Data models shared across the sync engine

mod device;
mod patient;
mod server_info;
mod session;
mod version;

pub use device::{Device, DeviceId, Registration};
pub use patient::Patient;
pub use server_info::{ExtraString, IdNumDescription, ServerInfo};
pub use session::{AbortFlag, SessionMode, TaskRecord};
pub use version::{Version, VersionParseError, CLIENT_VERSION, MINIMUM_SERVER_VERSION};
