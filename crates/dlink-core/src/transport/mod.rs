//! The contract between the link and the calculator's USB protocol.
//!
//! The protocol driver itself lives outside this crate. Everything here talks to a
//! device only through `DeviceTransport`, which keeps the queue and cache testable
//! against the in-memory implementation.

mod in_memory;

pub use in_memory::InMemoryTransport;

use std::future::Future;
use std::path::Path;

use crate::device::{DeviceId, DeviceInfo, FileInfo};
use crate::error::DeviceError;
pub use crate::progress::{ProgressSender, ProgressUpdate};

/// Async access to attached devices.
///
/// Implementations must tolerate calls for different devices running concurrently.
/// Calls for the same device are never issued concurrently by the queue, but reads
/// through the coordinator (`list_directory`) can overlap with a queued operation.
///
/// Transfers push `ProgressUpdate`s into the given sender as they go. The last update
/// of a successful transfer has `remaining == 0`.
pub trait DeviceTransport: Send + Sync + 'static {
    /// Opens the device and reads its system info.
    fn open_device(&self, device: DeviceId) -> impl Future<Output = Result<DeviceInfo, DeviceError>> + Send;

    /// Releases the handle taken by `open_device`.
    fn close_device(&self, device: DeviceId) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Re-reads system info (battery, free space) through the open handle.
    fn device_info(&self, device: DeviceId) -> impl Future<Output = Result<DeviceInfo, DeviceError>> + Send;

    /// Lists one directory. Entry `path`s are names, not full paths.
    fn list_directory(
        &self,
        device: DeviceId,
        path: &str,
    ) -> impl Future<Output = Result<Vec<FileInfo>, DeviceError>> + Send;

    /// Copies a device file to a local path.
    fn download_file(
        &self,
        device: DeviceId,
        src: &str,
        size: u64,
        dest: &Path,
        progress: ProgressSender,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Copies a local file into a device directory, keeping its file name.
    fn upload_file(
        &self,
        device: DeviceId,
        src: &Path,
        dest_dir: &str,
        progress: ProgressSender,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Sends an OS image to the device.
    fn upload_os(
        &self,
        device: DeviceId,
        src: &Path,
        progress: ProgressSender,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn delete_file(&self, device: DeviceId, path: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn delete_dir(&self, device: DeviceId, path: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn create_dir(&self, device: DeviceId, path: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Moves or renames a file or directory.
    fn move_path(
        &self,
        device: DeviceId,
        src: &str,
        dest: &str,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn copy_path(
        &self,
        device: DeviceId,
        src: &str,
        dest: &str,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
}
