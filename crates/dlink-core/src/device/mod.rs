//! Device identity, records, device-side paths, and the device registry.

pub mod path;
mod registry;
pub mod types;

pub use registry::{DeviceChanges, DeviceRegistry};
pub use types::{DeviceId, DeviceInfo, DeviceRecord, FileInfo, default_device_name};
