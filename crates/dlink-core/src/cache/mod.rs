//! TTL cache for device directory listings.
//!
//! Listings are keyed by device and normalized path. An entry is served only while
//! it's younger than the TTL. Expired entries are dropped when a read finds them and
//! by a periodic sweep, so entries for directories nobody revisits don't pile up.


use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::device::DeviceId;
use crate::device::FileInfo;
use crate::device::path::normalize_path;
use crate::ignore_poison::IgnorePoison;

/// How long to keep cached listings (30 seconds).
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;

/// How often the sweeper purges expired listings (60 seconds).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

type ListingKey = (DeviceId, String);

/// A cached directory listing with timestamp for invalidation.
#[derive(Debug, Clone)]
struct CachedListing {
    entries: Vec<FileInfo>,
    /// When this listing was cached (for TTL checks).
    cached_at: Instant,
}

/// Cache for directory listings across all devices.
pub struct ListingCache {
    listings: Mutex<HashMap<ListingKey, CachedListing>>,
    ttl: Duration,
    clock: SharedClock,
}

impl ListingCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            listings: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, listing: &CachedListing, now: Instant) -> bool {
        now.saturating_duration_since(listing.cached_at) < self.ttl
    }

    /// Returns the cached listing if it's still within the TTL.
    ///
    /// An expired entry found here is removed.
    pub fn get(&self, device: DeviceId, path: &str) -> Option<Vec<FileInfo>> {
        let key = (device, normalize_path(path));
        let now = self.clock.now();
        let mut listings = self.listings.lock_ignore_poison();

        match listings.get(&key) {
            Some(listing) if self.is_fresh(listing, now) => Some(listing.entries.clone()),
            Some(_) => {
                listings.remove(&key);
                debug!("Listing cache expired for {}:{}", device, key.1);
                None
            }
            None => None,
        }
    }

    /// Stores a listing, replacing any previous one for the same key.
    pub fn put(&self, device: DeviceId, path: &str, entries: Vec<FileInfo>) {
        let listing = CachedListing {
            entries,
            cached_at: self.clock.now(),
        };
        self.listings
            .lock_ignore_poison()
            .insert((device, normalize_path(path)), listing);
    }

    pub fn invalidate(&self, device: DeviceId, path: &str) {
        let path = normalize_path(path);
        if self.listings.lock_ignore_poison().remove(&(device, path.clone())).is_some() {
            debug!("Invalidated listing cache for {}:{}", device, path);
        }
    }

    /// Drops the listing of `path` and of every directory below it.
    pub fn invalidate_subtree(&self, device: DeviceId, path: &str) {
        let path = normalize_path(path);
        let prefix = if path == "/" { path.clone() } else { format!("{}/", path) };
        let mut listings = self.listings.lock_ignore_poison();
        let before = listings.len();
        listings.retain(|(id, key), _| *id != device || (key != &path && !key.starts_with(&prefix)));
        let removed = before - listings.len();
        if removed > 0 {
            debug!("Invalidated {} cached listings under {}:{}", removed, device, path);
        }
    }

    /// Drops every listing for one device.
    pub fn invalidate_device(&self, device: DeviceId) {
        let mut listings = self.listings.lock_ignore_poison();
        let before = listings.len();
        listings.retain(|(id, _), _| *id != device);
        debug!("Invalidated {} cached listings for {}", before - listings.len(), device);
    }

    pub fn invalidate_all(&self) {
        self.listings.lock_ignore_poison().clear();
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut listings = self.listings.lock_ignore_poison();
        let before = listings.len();
        listings.retain(|_, listing| self.is_fresh(listing, now));
        before - listings.len()
    }

    pub fn len(&self) -> usize {
        self.listings.lock_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Starts a background task that sweeps expired listings every `interval`.
///
/// The task holds only a weak reference and stops once the cache is dropped.
/// Must be called from within a tokio runtime.
pub fn spawn_sweeper(cache: &Arc<ListingCache>, interval: Duration) -> JoinHandle<()> {
    let cache: Weak<ListingCache> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                debug!("Listing cache dropped, stopping sweeper");
                break;
            };
            let removed = cache.sweep_expired();
            if removed > 0 {
                debug!("Swept {} expired listings, {} remaining", removed, cache.len());
            }
        }
    })
}
