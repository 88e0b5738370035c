//! Progress debouncing for long device transfers.
//!
//! Transfers report progress far more often than anyone needs to see it. The
//! reporter forwards at most one sample per device per debounce interval, and
//! always forwards the final one so completion is observable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::device::DeviceId;
use crate::ignore_poison::IgnorePoison;

/// Default minimum gap between forwarded samples (50ms).
pub const DEFAULT_PROGRESS_DEBOUNCE_MS: u64 = 50;

/// A raw progress sample pushed by the transport during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    #[serde(flatten)]
    pub id: DeviceId,
    /// Bytes left to transfer.
    pub remaining: u64,
    pub total: u64,
}

impl ProgressUpdate {
    /// Bytes transferred so far.
    pub fn current(&self) -> u64 {
        self.total.saturating_sub(self.remaining)
    }
}

/// Channel a transport pushes progress samples into.
pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// Per-device rate limiter for progress samples.
pub struct ProgressReporter {
    /// Last forwarded time per device.
    last_forwarded: Mutex<HashMap<DeviceId, Instant>>,
    debounce: Duration,
    clock: SharedClock,
}

impl ProgressReporter {
    pub fn new(debounce: Duration, clock: SharedClock) -> Self {
        Self {
            last_forwarded: Mutex::new(HashMap::new()),
            debounce,
            clock,
        }
    }

    /// Decides whether a sample should reach observers.
    ///
    /// Completion (`current >= total`) is always forwarded. Anything else is
    /// forwarded only if the debounce interval has elapsed since the last
    /// forwarded sample for this device.
    pub fn report(&self, device: DeviceId, current: u64, total: u64) -> bool {
        let now = self.clock.now();
        let mut last_forwarded = self.last_forwarded.lock_ignore_poison();

        if current < total
            && let Some(last) = last_forwarded.get(&device)
            && now.saturating_duration_since(*last) < self.debounce
        {
            return false;
        }

        last_forwarded.insert(device, now);
        true
    }

    /// Forgets a device, so its next sample is forwarded immediately.
    pub fn clear(&self, device: DeviceId) {
        self.last_forwarded.lock_ignore_poison().remove(&device);
    }
}
