//! Error types for device operations.

use serde::Serialize;

use crate::device::DeviceId;

/// Errors from device I/O, the listing read path, and the operation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeviceError {
    /// Communication with the device failed (unreachable, I/O failure mid-transfer).
    Transport { device: DeviceId, message: String },
    /// The path doesn't exist on the device.
    NotFound { device: DeviceId, path: String },
    /// The device went away while talking to it.
    Disconnected { device: DeviceId },
    /// The device isn't known to the registry.
    DeviceNotFound { device: DeviceId },
    /// Two operations ran on one device at once. Always a bug.
    ConcurrencyViolation { device: DeviceId, message: String },
    /// Host-side I/O (reading an upload source, writing a download).
    Io { message: String },
}

impl DeviceError {
    pub fn transport(device: DeviceId, message: impl Into<String>) -> Self {
        Self::Transport {
            device,
            message: message.into(),
        }
    }

    pub fn not_found(device: DeviceId, path: impl Into<String>) -> Self {
        Self::NotFound {
            device,
            path: path.into(),
        }
    }

    /// The device this error relates to, if any.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::Transport { device, .. }
            | Self::NotFound { device, .. }
            | Self::Disconnected { device }
            | Self::DeviceNotFound { device }
            | Self::ConcurrencyViolation { device, .. } => Some(*device),
            Self::Io { .. } => None,
        }
    }

    /// Returns true if the operation may succeed if enqueued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns a message suitable for showing in the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { message, .. } => {
                format!("Couldn't talk to the calculator: {}. Check the cable and try again.", message)
            }
            Self::NotFound { path, .. } => {
                format!("File or folder not found: {}. It may have been deleted.", path)
            }
            Self::Disconnected { .. } => "The calculator was disconnected. Reconnect it to continue.".to_string(),
            Self::DeviceNotFound { .. } => "Calculator not found. It may have been unplugged.".to_string(),
            Self::ConcurrencyViolation { .. } => {
                "Internal error: two operations ran at once. Please report this.".to_string()
            }
            Self::Io { message } => message.clone(),
        }
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { device, message } => write!(f, "Transport error on {device}: {message}"),
            Self::NotFound { device, path } => write!(f, "Path not found on {device}: {path}"),
            Self::Disconnected { device } => write!(f, "Device disconnected: {device}"),
            Self::DeviceNotFound { device } => write!(f, "Device not found: {device}"),
            Self::ConcurrencyViolation { device, message } => {
                write!(f, "Concurrency violation on {device}: {message}")
            }
            Self::Io { message } => write!(f, "I/O error: {message}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}
