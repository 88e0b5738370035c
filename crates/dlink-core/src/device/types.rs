//! Device identity and the records exchanged with the frontend.
//!
//! These types are serialized to JSON with camelCase field names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one attached calculator by its USB bus and address.
///
/// Stable for as long as the device stays plugged in. Used as the partition key for
/// the operation queue, the listing cache, and progress debouncing.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DeviceId {
    pub bus_number: u8,
    pub address: u8,
}

impl DeviceId {
    pub const fn new(bus_number: u8, address: u8) -> Self {
        Self { bus_number, address }
    }

    /// Parses the key form produced by `Display`.
    ///
    /// Format: "{bus_number}-{address}"
    pub fn parse(key: &str) -> Option<Self> {
        let (bus, address) = key.split_once('-')?;
        Some(Self {
            bus_number: bus.parse().ok()?,
            address: address.parse().ok()?,
        })
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid device id: {}", s))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus_number, self.address)
    }
}

/// A single entry of a device directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Entry name within its directory (not the full path).
    pub path: String,
    pub is_dir: bool,
    /// Modification time, Unix seconds.
    pub date: u64,
    /// In bytes. Zero for directories.
    pub size: u64,
}

impl FileInfo {
    pub fn file(name: &str, size: u64, date: u64) -> Self {
        Self {
            path: name.to_string(),
            is_dir: false,
            date,
            size,
        }
    }

    pub fn dir(name: &str, date: u64) -> Self {
        Self {
            path: name.to_string(),
            is_dir: true,
            date,
            size: 0,
        }
    }
}

/// System information reported by an opened calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub free_storage: u64,
    pub total_storage: u64,
    pub free_ram: u64,
    pub total_ram: u64,
    /// Battery level as a percentage.
    pub battery: u8,
    pub is_charging: bool,
    pub os_version: String,
    pub boot1_version: String,
    pub boot2_version: String,
    pub hw_type: u8,
    pub clock_speed: u8,
    pub lcd_width: u16,
    pub lcd_height: u16,
    pub lcd_bpp: u8,
    pub lcd_sample_mode: u8,
}

/// A known (attached) device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(flatten)]
    pub id: DeviceId,
    pub name: String,
    pub is_cx_ii: bool,
    /// The device was detected but can't be opened without a driver (Windows).
    pub needs_drivers: bool,
    /// Populated once the device has been opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<DeviceInfo>,
}

impl DeviceRecord {
    /// Creates a record named after the hardware family.
    pub fn new(id: DeviceId, is_cx_ii: bool) -> Self {
        Self {
            id,
            name: default_device_name(is_cx_ii).to_string(),
            is_cx_ii,
            needs_drivers: false,
            info: None,
        }
    }
}

/// Name used when the device doesn't report a product string.
pub fn default_device_name(is_cx_ii: bool) -> &'static str {
    if is_cx_ii { "TI-Nspire CX II" } else { "TI-Nspire" }
}
