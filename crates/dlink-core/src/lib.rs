//! Device link core for USB-attached TI-Nspire calculators.
//!
//! Browsing reads go through a short-lived listing cache. Everything that changes a
//! device (or moves bytes to or from it) goes through a per-device FIFO queue, so a
//! calculator only ever handles one command at a time. The USB protocol itself sits
//! behind the `DeviceTransport` trait.

// Warn on redundant path prefixes (e.g., std::path::Path when Path is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]
#![warn(unused_crate_dependencies)]

//noinspection RsUnusedImport
// env_logger is only initialized by the dlink-sim binary
use env_logger as _;

pub mod cache;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
mod ignore_poison;
pub mod link;
pub mod progress;
pub mod queue;
#[cfg(test)]
mod test_support;
pub mod transport;

pub use cache::ListingCache;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, LinkConfig, load_config, load_config_or_default};
pub use device::{DeviceChanges, DeviceId, DeviceInfo, DeviceRecord, FileInfo};
pub use error::DeviceError;
pub use link::DeviceLink;
pub use progress::{ProgressReporter, ProgressUpdate};
pub use queue::{OperationQueue, QueueEvent, QueueItem, QueueOperation, TransferProgress};
pub use transport::{DeviceTransport, InMemoryTransport};
