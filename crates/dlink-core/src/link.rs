//! The device link: one place that owns the queue, the listing cache, and the set of
//! known devices.
//!
//! Reads go through the cache. Mutations go through the queue, and when one settles
//! the cached listings of every directory it touched are dropped, so the next read
//! sees the device's new state.

#[cfg(test)]
mod link_test;

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{ListingCache, spawn_sweeper};
use crate::clock::{SharedClock, SystemClock};
use crate::config::LinkConfig;
use crate::device::path::normalize_path;
use crate::device::{DeviceChanges, DeviceId, DeviceInfo, DeviceRecord, DeviceRegistry, FileInfo};
use crate::error::DeviceError;
use crate::ignore_poison::IgnorePoison;
use crate::progress::ProgressReporter;
use crate::queue::{OperationQueue, QueueEvent, QueueItem, QueueOperation, QueueOptions, SettledHook};
use crate::transport::DeviceTransport;

/// Coordinates device access for the rest of the app.
pub struct DeviceLink<T: DeviceTransport> {
    transport: Arc<T>,
    cache: Arc<ListingCache>,
    queue: OperationQueue<T>,
    registry: Mutex<DeviceRegistry>,
    sweeper: Option<JoinHandle<()>>,
    config: LinkConfig,
}

impl<T: DeviceTransport> DeviceLink<T> {
    pub fn new(transport: Arc<T>, config: LinkConfig) -> Self {
        Self::with_clock(transport, config, SystemClock::shared())
    }

    /// Like `new`, with an explicit time source for the cache and progress debouncing.
    ///
    /// The cache sweeper is only started when called inside a tokio runtime.
    pub fn with_clock(transport: Arc<T>, config: LinkConfig, clock: SharedClock) -> Self {
        let cache = Arc::new(ListingCache::new(config.cache_ttl(), Arc::clone(&clock)));

        let on_settled: SettledHook = {
            let cache = Arc::clone(&cache);
            Arc::new(move |device: DeviceId, operation: &QueueOperation| {
                for dir in operation.affected_directories() {
                    cache.invalidate(device, &dir);
                }
                for root in operation.affected_subtrees() {
                    cache.invalidate_subtree(device, &root);
                }
            })
        };
        let download_dir = config.resolve_download_dir();
        if download_dir.is_none() {
            warn!("No download directory configured or found, downloads will fail");
        }
        let queue = OperationQueue::new(
            Arc::clone(&transport),
            ProgressReporter::new(config.progress_debounce(), clock),
            QueueOptions {
                download_dir,
                on_settled: Some(on_settled),
            },
        );

        let sweeper = if config.sweep_interval().is_zero() {
            debug!("Listing cache sweep disabled");
            None
        } else if tokio::runtime::Handle::try_current().is_ok() {
            Some(spawn_sweeper(&cache, config.sweep_interval()))
        } else {
            warn!("No tokio runtime, expired listings will only be dropped when read");
            None
        };

        info!(
            "Device link ready (cache TTL {}ms, sweep every {}ms, progress debounce {}ms)",
            config.cache_ttl_ms, config.cache_sweep_interval_ms, config.progress_debounce_ms
        );

        Self {
            transport,
            cache,
            queue,
            registry: Mutex::new(DeviceRegistry::new()),
            sweeper,
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn ensure_known(&self, device: DeviceId) -> Result<(), DeviceError> {
        if self.registry.lock_ignore_poison().contains(device) {
            Ok(())
        } else {
            Err(DeviceError::DeviceNotFound { device })
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Lists a directory, serving a cached listing while it's fresh.
    pub async fn read_directory(&self, device: DeviceId, path: &str) -> Result<Vec<FileInfo>, DeviceError> {
        self.ensure_known(device)?;
        if let Some(entries) = self.cache.get(device, path) {
            debug!("Listing cache hit for {}:{}", device, normalize_path(path));
            return Ok(entries);
        }
        self.fetch_directory(device, path).await
    }

    /// Lists a directory from the device, replacing whatever was cached.
    pub async fn refresh_directory(&self, device: DeviceId, path: &str) -> Result<Vec<FileInfo>, DeviceError> {
        self.ensure_known(device)?;
        self.fetch_directory(device, path).await
    }

    async fn fetch_directory(&self, device: DeviceId, path: &str) -> Result<Vec<FileInfo>, DeviceError> {
        let path = normalize_path(path);
        let entries = self.transport.list_directory(device, &path).await?;
        debug!("Listed {}:{} ({} entries)", device, path, entries.len());
        if self.ensure_known(device).is_ok() {
            self.cache.put(device, &path, entries.clone());
        } else {
            debug!("{} was removed while listing {}, not caching", device, path);
        }
        Ok(entries)
    }

    /// Opens a known device and remembers the info it reports.
    ///
    /// A device that's already open isn't opened again; its stored info is returned.
    pub async fn open_device(&self, device: DeviceId) -> Result<DeviceInfo, DeviceError> {
        let stored = {
            let registry = self.registry.lock_ignore_poison();
            let record = registry.get(device).ok_or(DeviceError::DeviceNotFound { device })?;
            record.info.clone()
        };
        if let Some(info) = stored {
            debug!("{} is already open", device);
            return Ok(info);
        }

        let info = self.transport.open_device(device).await?;
        self.registry.lock_ignore_poison().set_info(device, info.clone());
        info!("Opened {} ({}, OS {})", device, info.name, info.os_version);
        Ok(info)
    }

    /// Closes a device's handle and forgets its info. Closing a device that isn't
    /// open is a no-op.
    pub async fn close_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let is_open = {
            let registry = self.registry.lock_ignore_poison();
            let record = registry.get(device).ok_or(DeviceError::DeviceNotFound { device })?;
            record.info.is_some()
        };
        if !is_open {
            return Ok(());
        }

        self.transport.close_device(device).await?;
        self.registry.lock_ignore_poison().clear_info(device);
        info!("Closed {}", device);
        Ok(())
    }

    /// Re-reads the info of an open device, e.g. after a transfer changed its free space.
    pub async fn refresh_device_info(&self, device: DeviceId) -> Result<DeviceInfo, DeviceError> {
        self.ensure_known(device)?;
        let info = self.transport.device_info(device).await?;
        self.registry.lock_ignore_poison().set_info(device, info.clone());
        debug!("Refreshed info for {} ({}% battery)", device, info.battery);
        Ok(info)
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Queues a command for a known device and returns its sequence id.
    pub fn enqueue(&self, device: DeviceId, operation: QueueOperation) -> Result<u64, DeviceError> {
        self.ensure_known(device)?;
        Ok(self.queue.enqueue(device, operation))
    }

    pub fn pending(&self, device: DeviceId) -> Vec<QueueItem> {
        self.queue.pending(device)
    }

    pub fn is_busy(&self, device: DeviceId) -> bool {
        self.queue.is_draining(device)
    }

    /// Resolves once the device's queue has no worker, polling every `poll`.
    pub async fn wait_until_idle(&self, device: DeviceId, poll: Duration) {
        while self.is_busy(device) {
            tokio::time::sleep(poll).await;
        }
    }

    pub fn last_error(&self, device: DeviceId) -> Option<DeviceError> {
        self.queue.last_error(device)
    }

    pub fn clear_last_error(&self, device: DeviceId) {
        self.queue.clear_last_error(device);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    // ========================================================================
    // Devices
    // ========================================================================

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.lock_ignore_poison().list()
    }

    pub fn device(&self, device: DeviceId) -> Option<DeviceRecord> {
        self.registry.lock_ignore_poison().get(device).cloned()
    }

    pub fn selected_device(&self) -> Option<DeviceRecord> {
        self.registry.lock_ignore_poison().selected().cloned()
    }

    pub fn select_device(&self, device: Option<DeviceId>) -> bool {
        self.registry.lock_ignore_poison().select(device)
    }

    /// Handles a device arrival. Returns `true` if it wasn't known yet.
    pub fn on_device_added(&self, record: DeviceRecord) -> bool {
        self.registry.lock_ignore_poison().add(record)
    }

    /// Handles a device departure: forgets it and disposes of its queue, cached
    /// listings, and progress state.
    pub fn on_device_removed(&self, device: DeviceId) -> Option<DeviceRecord> {
        let removed = self.registry.lock_ignore_poison().remove(device);
        self.dispose(device);
        removed
    }

    /// Reconciles known devices with a fresh enumeration.
    pub fn reconcile(&self, current: Vec<DeviceRecord>) -> DeviceChanges {
        let changes = self.registry.lock_ignore_poison().reconcile(current);
        for device in &changes.removed {
            self.dispose(*device);
        }
        if !changes.is_empty() {
            info!(
                "Device reconcile: {} added, {} removed",
                changes.added.len(),
                changes.removed.len()
            );
        }
        changes
    }

    fn dispose(&self, device: DeviceId) {
        self.queue.remove_device(device);
        self.cache.invalidate_device(device);
    }

    /// Drops every cached listing.
    pub fn reset(&self) {
        self.cache.invalidate_all();
        info!("Listing cache reset");
    }
}

impl<T: DeviceTransport> Drop for DeviceLink<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
