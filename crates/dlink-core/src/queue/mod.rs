//! Per-device operation queue.
//!
//! Every mutating command for a device goes through here. Each device has its own
//! FIFO and at most one worker task draining it, so a device never sees two commands
//! at once, while different devices progress independently.
//!
//! Whether a worker is running is tracked by the `draining` flag on the device's
//! queue. Enqueue checks and sets it in the same critical section that appends the
//! item, and the worker clears it in the same critical section that finds the queue
//! empty. Neither step awaits, so there's no window where two workers can start, or
//! where an item is left behind with no worker.

mod types;


pub use types::{QueueEvent, QueueItem, QueueOperation, TransferProgress};

use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

use crate::device::DeviceId;
use crate::device::path::file_name;
use crate::error::DeviceError;
use crate::ignore_poison::IgnorePoison;
use crate::progress::{ProgressReporter, ProgressSender, ProgressUpdate};
use crate::transport::DeviceTransport;

/// Capacity of the event channel. Slow subscribers miss events rather than stall workers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// File name used for downloads whose device path has no final component.
const FALLBACK_DOWNLOAD_NAME: &str = "file";

/// Called after every item leaves the queue, successful or not.
pub type SettledHook = Arc<dyn Fn(DeviceId, &QueueOperation) + Send + Sync>;

/// Construction options for `OperationQueue`.
#[derive(Default, Clone)]
pub struct QueueOptions {
    /// Host directory that downloads are written into.
    pub download_dir: Option<PathBuf>,
    pub on_settled: Option<SettledHook>,
}

struct DeviceQueue {
    items: VecDeque<QueueItem>,
    /// A worker task owns this queue.
    draining: bool,
    /// Id of the item the worker is running right now.
    executing: Option<u64>,
    /// Distinguishes this queue from one re-created after the device was removed.
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<DeviceId, DeviceQueue>,
    last_errors: HashMap<DeviceId, DeviceError>,
    next_generation: u64,
}

impl QueueState {
    fn queue_mut(&mut self, device: DeviceId) -> &mut DeviceQueue {
        let next_generation = &mut self.next_generation;
        self.queues.entry(device).or_insert_with(|| {
            *next_generation += 1;
            DeviceQueue {
                items: VecDeque::new(),
                draining: false,
                executing: None,
                generation: *next_generation,
            }
        })
    }
}

struct QueueShared<T> {
    transport: Arc<T>,
    state: Mutex<QueueState>,
    reporter: ProgressReporter,
    events: broadcast::Sender<QueueEvent>,
    next_id: AtomicU64,
    download_dir: Option<PathBuf>,
    on_settled: Option<SettledHook>,
}

/// Serializes device commands per device.
///
/// Cheap to clone; clones share the same queues.
pub struct OperationQueue<T> {
    inner: Arc<QueueShared<T>>,
}

impl<T> Clone for OperationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: DeviceTransport> OperationQueue<T> {
    pub fn new(transport: Arc<T>, reporter: ProgressReporter, options: QueueOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(QueueShared {
                transport,
                state: Mutex::new(QueueState::default()),
                reporter,
                events,
                next_id: AtomicU64::new(1),
                download_dir: options.download_dir,
                on_settled: options.on_settled,
            }),
        }
    }

    /// Appends an operation to the device's queue and returns its sequence id.
    ///
    /// Starts a worker if none is draining this device. Never waits for the device.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, device: DeviceId, operation: QueueOperation) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let kind = operation.kind();

        let start_generation = {
            let mut state = self.inner.state.lock_ignore_poison();
            let queue = state.queue_mut(device);
            queue.items.push_back(QueueItem {
                id,
                operation,
                progress: None,
            });
            if queue.draining {
                None
            } else {
                queue.draining = true;
                Some(queue.generation)
            }
        };

        debug!("Enqueued {} #{} on {}", kind, id, device);
        if let Some(generation) = start_generation {
            debug!("Starting queue worker for {} (generation {})", device, generation);
            tokio::spawn(Arc::clone(&self.inner).drain(device, generation));
        }
        id
    }

    pub fn is_draining(&self, device: DeviceId) -> bool {
        let state = self.inner.state.lock_ignore_poison();
        state.queues.get(&device).is_some_and(|queue| queue.draining)
    }

    /// Snapshot of the device's queue, executing item first.
    pub fn pending(&self, device: DeviceId) -> Vec<QueueItem> {
        let state = self.inner.state.lock_ignore_poison();
        state
            .queues
            .get(&device)
            .map(|queue| queue.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_error(&self, device: DeviceId) -> Option<DeviceError> {
        self.inner.state.lock_ignore_poison().last_errors.get(&device).cloned()
    }

    pub fn clear_last_error(&self, device: DeviceId) {
        self.inner.state.lock_ignore_poison().last_errors.remove(&device);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Drops the device's queue, last error, and progress state.
    ///
    /// Pending items are discarded without running, each reported as finished with
    /// a `Disconnected` error. An item already executing runs to completion and
    /// reports its own outcome, but its worker then sees the queue is gone and exits.
    /// Returns how many items were dropped (including one in flight).
    pub fn remove_device(&self, device: DeviceId) -> usize {
        let removed = {
            let mut state = self.inner.state.lock_ignore_poison();
            state.last_errors.remove(&device);
            state.queues.remove(&device)
        };
        self.inner.reporter.clear(device);

        let Some(queue) = removed else {
            return 0;
        };
        let dropped = queue.items.len();
        let executing = queue.executing;
        for item in queue.items.into_iter().filter(|item| Some(item.id) != executing) {
            let _ = self.inner.events.send(QueueEvent::OperationFinished {
                device,
                item_id: item.id,
                error: Some(DeviceError::Disconnected { device }),
            });
        }
        info!("Removed operation queue for {} ({} item(s) dropped)", device, dropped);
        dropped
    }
}

impl<T: DeviceTransport> QueueShared<T> {
    /// Worker loop: runs the head item to completion, removes it, repeats.
    async fn drain(self: Arc<Self>, device: DeviceId, generation: u64) {
        loop {
            let item = {
                let mut state = self.state.lock_ignore_poison();
                let Some(queue) = state.queues.get_mut(&device) else {
                    debug!("Queue for {} was removed, worker exiting", device);
                    return;
                };
                if queue.generation != generation {
                    debug!("Queue for {} was replaced, stale worker exiting", device);
                    return;
                }
                match queue.items.front() {
                    Some(item) => {
                        queue.executing = Some(item.id);
                        item.clone()
                    }
                    None => {
                        queue.draining = false;
                        debug!("Queue for {} drained", device);
                        return;
                    }
                }
            };

            let result = self.execute(device, &item).await;
            self.reporter.clear(device);
            self.settle(device, generation, &item, result);
        }
    }

    /// Runs one item, relaying transport progress while it's in flight.
    async fn execute(&self, device: DeviceId, item: &QueueItem) -> Result<(), DeviceError> {
        debug!("Executing {} #{} on {}", item.operation.kind(), item.id, device);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let work = self.dispatch(device, &item.operation, progress_tx);
        tokio::pin!(work);

        let result = loop {
            tokio::select! {
                biased;
                Some(update) = progress_rx.recv() => self.record_progress(device, item.id, update),
                result = &mut work => break result,
            }
        };

        // Samples sent right before the transfer returned
        while let Ok(update) = progress_rx.try_recv() {
            self.record_progress(device, item.id, update);
        }
        result
    }

    async fn dispatch(
        &self,
        device: DeviceId,
        operation: &QueueOperation,
        progress: ProgressSender,
    ) -> Result<(), DeviceError> {
        let transport = &self.transport;
        match operation {
            QueueOperation::Download { path, size } => {
                let dest = self.download_destination(path)?;
                transport.download_file(device, path, *size, &dest, progress).await
            }
            QueueOperation::Upload { src, dest_dir } => transport.upload_file(device, src, dest_dir, progress).await,
            QueueOperation::UploadOs { src } => transport.upload_os(device, src, progress).await,
            QueueOperation::Delete { path, is_dir: true } => transport.delete_dir(device, path).await,
            QueueOperation::Delete { path, is_dir: false } => transport.delete_file(device, path).await,
            QueueOperation::CreateDir { path } => transport.create_dir(device, path).await,
            QueueOperation::Move { src, dest } => transport.move_path(device, src, dest).await,
            QueueOperation::Copy { src, dest } => transport.copy_path(device, src, dest).await,
        }
    }

    /// Where a downloaded device file lands on the host.
    fn download_destination(&self, device_path: &str) -> Result<PathBuf, DeviceError> {
        let dir = self.download_dir.as_ref().ok_or_else(|| DeviceError::Io {
            message: "No download directory available".to_string(),
        })?;
        Ok(dir.join(file_name(device_path).unwrap_or(FALLBACK_DOWNLOAD_NAME)))
    }

    fn record_progress(&self, device: DeviceId, item_id: u64, update: ProgressUpdate) {
        let current = update.current();
        if !self.reporter.report(device, current, update.total) {
            return;
        }

        {
            let mut state = self.state.lock_ignore_poison();
            if let Some(queue) = state.queues.get_mut(&device)
                && let Some(head) = queue.items.front_mut()
                && head.id == item_id
            {
                head.progress = Some(TransferProgress {
                    current,
                    total: update.total,
                });
            }
        }

        // No subscribers is fine
        let _ = self.events.send(QueueEvent::Progress {
            device,
            item_id,
            current,
            total: update.total,
        });
    }

    /// Removes a finished item and records its outcome.
    fn settle(&self, device: DeviceId, generation: u64, item: &QueueItem, result: Result<(), DeviceError>) {
        let error = result.err();

        let violation = {
            let mut state = self.state.lock_ignore_poison();
            let state = &mut *state;
            let mut violation = None;

            if let Some(queue) = state.queues.get_mut(&device)
                && queue.generation == generation
            {
                queue.executing = None;
                let head_id = queue.items.front().map(|head| head.id);
                if head_id == Some(item.id) {
                    queue.items.pop_front();
                } else {
                    queue.items.retain(|queued| queued.id != item.id);
                    violation = Some(DeviceError::ConcurrencyViolation {
                        device,
                        message: format!("Finished item #{} but the queue head was {:?}", item.id, head_id),
                    });
                }

                if let Some(err) = violation.as_ref().or(error.as_ref()) {
                    state.last_errors.insert(device, err.clone());
                }
            }
            violation
        };

        let kind = item.operation.kind();
        if let Some(violation) = &violation {
            error!("{}", violation);
        }
        match &error {
            Some(err) => warn!("{} #{} failed on {}: {}", kind, item.id, device, err),
            None => debug!("{} #{} finished on {}", kind, item.id, device),
        }

        if let Some(hook) = &self.on_settled {
            hook(device, &item.operation);
        }

        let _ = self.events.send(QueueEvent::OperationFinished {
            device,
            item_id: item.id,
            error: error.or(violation),
        });
    }
}
