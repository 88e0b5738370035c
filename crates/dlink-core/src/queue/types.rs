//! Types for the per-device operation queue.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::device::DeviceId;
use crate::device::path::{normalize_path, parent_path};
use crate::error::DeviceError;

/// A mutating (or transferring) command for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum QueueOperation {
    /// Copy a device file to the host download directory.
    #[serde(rename_all = "camelCase")]
    Download { path: String, size: u64 },
    /// Copy a host file into a device directory.
    #[serde(rename_all = "camelCase")]
    Upload { src: PathBuf, dest_dir: String },
    /// Install an OS image.
    UploadOs { src: PathBuf },
    #[serde(rename_all = "camelCase")]
    Delete { path: String, is_dir: bool },
    CreateDir { path: String },
    Move { src: String, dest: String },
    Copy { src: String, dest: String },
}

impl QueueOperation {
    /// Device directories whose listings this operation may change.
    pub fn affected_directories(&self) -> Vec<String> {
        let dirs = match self {
            Self::Download { .. } | Self::UploadOs { .. } => Vec::new(),
            Self::Upload { dest_dir, .. } => vec![normalize_path(dest_dir)],
            Self::Delete { path, is_dir } => {
                let mut dirs = vec![parent_path(path)];
                if *is_dir {
                    dirs.push(normalize_path(path));
                }
                dirs
            }
            Self::CreateDir { path } => vec![parent_path(path)],
            Self::Move { src, dest } => vec![parent_path(src), parent_path(dest), normalize_path(src)],
            Self::Copy { dest, .. } => vec![parent_path(dest)],
        };

        let mut unique: Vec<String> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if !unique.contains(&dir) {
                unique.push(dir);
            }
        }
        unique
    }

    /// Device directories whose listings, and those of everything below them, no
    /// longer describe the device after this operation.
    pub fn affected_subtrees(&self) -> Vec<String> {
        match self {
            Self::Delete { path, is_dir: true } => vec![normalize_path(path)],
            Self::Move { src, dest } => vec![normalize_path(src), normalize_path(dest)],
            _ => Vec::new(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Download { .. } => "download",
            Self::Upload { .. } => "upload",
            Self::UploadOs { .. } => "uploadOs",
            Self::Delete { .. } => "delete",
            Self::CreateDir { .. } => "createDir",
            Self::Move { .. } => "move",
            Self::Copy { .. } => "copy",
        }
    }
}

/// Bytes moved so far by the executing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub current: u64,
    pub total: u64,
}

/// An operation waiting in (or at the head of) a device queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Sequence id assigned at enqueue, unique within this queue.
    pub id: u64,
    pub operation: QueueOperation,
    /// Set only while the item is executing and the transport reports progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
}

/// Notifications broadcast by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum QueueEvent {
    /// Debounced progress of the executing item.
    #[serde(rename_all = "camelCase")]
    Progress {
        device: DeviceId,
        item_id: u64,
        current: u64,
        total: u64,
    },
    /// An item left the queue. `error` is `None` on success.
    #[serde(rename_all = "camelCase")]
    OperationFinished {
        device: DeviceId,
        item_id: u64,
        error: Option<DeviceError>,
    },
}
