//! Poison-tolerant locking for the queue, cache, registry, and debounce maps.
//!
//! None of these maps is left half-updated by a panicking holder: every critical
//! section is a single insert, remove, or lookup.

use std::sync::{Mutex, MutexGuard};

pub(crate) trait IgnorePoison<T> {
    /// Locks the mutex, recovering the guard if a previous holder panicked.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}
