//! In-memory transport for tests and the simulator.
//!
//! Each device is a flat map of normalized paths to nodes. Transfers are split into
//! chunks with a yield between them, so progress and interleaving behave like a real
//! USB link. The transport also tracks calls in flight per device and flags any
//! overlap, which is how tests prove the queue never issues two commands at once.

use log::{debug, error};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::DeviceTransport;
use crate::device::path::{file_name, join_path, normalize_path, parent_path};
use crate::device::{DeviceId, DeviceInfo, FileInfo};
use crate::error::DeviceError;
use crate::ignore_poison::IgnorePoison;
use crate::progress::{ProgressSender, ProgressUpdate};

/// Bytes per simulated USB transfer chunk.
const DEFAULT_CHUNK_SIZE: u64 = 1024;

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    data: Vec<u8>,
    date: u64,
}

#[derive(Debug)]
struct DeviceTree {
    info: DeviceInfo,
    open: bool,
    nodes: BTreeMap<String, Node>,
}

impl DeviceTree {
    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.nodes.get(path).is_some_and(|node| node.is_dir)
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    /// The node at `path` and every node below it.
    fn subtree_keys(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .keys()
            .filter(|key| key.as_str() == path || key.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

/// A `DeviceTransport` backed by in-memory file trees.
pub struct InMemoryTransport {
    devices: Mutex<HashMap<DeviceId, DeviceTree>>,
    failures: Mutex<HashSet<(DeviceId, String)>>,
    calls: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<DeviceId, usize>>,
    overlap_detected: AtomicBool,
    list_calls: AtomicUsize,
    chunk_size: u64,
    latency: Duration,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            overlap_detected: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            chunk_size: DEFAULT_CHUNK_SIZE,
            latency: Duration::ZERO,
        }
    }

    /// Sleeps this long inside every call, which widens any overlap window.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Attaches a device with an empty root.
    pub fn add_device(&self, device: DeviceId, info: DeviceInfo) {
        self.devices.lock_ignore_poison().insert(
            device,
            DeviceTree {
                info,
                open: false,
                nodes: BTreeMap::new(),
            },
        );
    }

    /// Detaches a device. Later calls for it fail with `Disconnected`.
    pub fn disconnect(&self, device: DeviceId) {
        self.devices.lock_ignore_poison().remove(&device);
    }

    /// Replaces the info the device reports, e.g. to simulate a draining battery.
    pub fn set_device_info(&self, device: DeviceId, info: DeviceInfo) {
        if let Some(tree) = self.devices.lock_ignore_poison().get_mut(&device) {
            tree.info = info;
        }
    }

    pub fn is_open(&self, device: DeviceId) -> bool {
        self.devices
            .lock_ignore_poison()
            .get(&device)
            .is_some_and(|tree| tree.open)
    }

    /// Seeds a directory, creating missing parents.
    pub fn seed_dir(&self, device: DeviceId, path: &str) {
        self.seed(device, path, true, Vec::new());
    }

    /// Seeds a file, creating missing parents.
    pub fn seed_file(&self, device: DeviceId, path: &str, data: &[u8]) {
        self.seed(device, path, false, data.to_vec());
    }

    fn seed(&self, device: DeviceId, path: &str, is_dir: bool, data: Vec<u8>) {
        let path = normalize_path(path);
        let mut devices = self.devices.lock_ignore_poison();
        let Some(tree) = devices.get_mut(&device) else {
            return;
        };

        let mut parent = parent_path(&path);
        while parent != "/" {
            tree.nodes.entry(parent.clone()).or_insert(Node {
                is_dir: true,
                data: Vec::new(),
                date: now_secs(),
            });
            parent = parent_path(&parent);
        }
        tree.nodes.insert(
            path,
            Node {
                is_dir,
                data,
                date: now_secs(),
            },
        );
    }

    /// Makes every call touching `path` on `device` fail with a transport error.
    pub fn fail_on(&self, device: DeviceId, path: &str) {
        self.failures.lock_ignore_poison().insert((device, normalize_path(path)));
    }

    pub fn exists(&self, device: DeviceId, path: &str) -> bool {
        let path = normalize_path(path);
        self.devices
            .lock_ignore_poison()
            .get(&device)
            .is_some_and(|tree| tree.exists(&path))
    }

    pub fn is_dir(&self, device: DeviceId, path: &str) -> bool {
        let path = normalize_path(path);
        self.devices
            .lock_ignore_poison()
            .get(&device)
            .is_some_and(|tree| tree.is_dir(&path))
    }

    pub fn file_contents(&self, device: DeviceId, path: &str) -> Option<Vec<u8>> {
        let path = normalize_path(path);
        let devices = self.devices.lock_ignore_poison();
        let node = devices.get(&device)?.nodes.get(&path)?;
        (!node.is_dir).then(|| node.data.clone())
    }

    /// Every call made so far, in start order, as "{operation} {device} {args}".
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock_ignore_poison().clone()
    }

    /// How many times `list_directory` was called.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// True if two calls for the same device were ever in flight together.
    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst)
    }

    fn begin(&self, device: DeviceId, call: String) -> InFlight<'_> {
        let mut in_flight = self.in_flight.lock_ignore_poison();
        let count = in_flight.entry(device).or_insert(0);
        if *count > 0 {
            error!("Overlapping calls on {}: {} started while {} call(s) in flight", device, call, count);
            self.overlap_detected.store(true, Ordering::SeqCst);
        }
        *count += 1;
        debug!("Transport call: {}", call);
        self.calls.lock_ignore_poison().push(call);
        InFlight {
            transport: self,
            device,
        }
    }

    async fn pause(&self) {
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn check_failure(&self, device: DeviceId, paths: &[&str]) -> Result<(), DeviceError> {
        let failures = self.failures.lock_ignore_poison();
        for path in paths {
            if failures.contains(&(device, normalize_path(path))) {
                return Err(DeviceError::transport(device, format!("Injected failure for {}", path)));
            }
        }
        Ok(())
    }

    fn with_tree<R>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&mut DeviceTree) -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        let mut devices = self.devices.lock_ignore_poison();
        let tree = devices.get_mut(&device).ok_or(DeviceError::Disconnected { device })?;
        f(tree)
    }

    /// Emits progress in chunk-sized steps, ending with `remaining == 0`.
    async fn stream_progress(&self, device: DeviceId, total: u64, progress: &ProgressSender) {
        let mut sent = 0;
        loop {
            sent = (sent + self.chunk_size).min(total);
            // The receiver going away only means nobody is watching
            let _ = progress.send(ProgressUpdate {
                id: device,
                remaining: total - sent,
                total,
            });
            if sent >= total {
                break;
            }
            self.pause().await;
        }
    }
}

/// Marks one call as in flight until dropped.
struct InFlight<'a> {
    transport: &'a InMemoryTransport,
    device: DeviceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.transport.in_flight.lock_ignore_poison();
        if let Some(count) = in_flight.get_mut(&self.device) {
            *count = count.saturating_sub(1);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn require_dir(tree: &DeviceTree, device: DeviceId, path: &str) -> Result<(), DeviceError> {
    if tree.is_dir(path) {
        Ok(())
    } else if tree.exists(path) {
        Err(DeviceError::transport(device, format!("Not a directory: {}", path)))
    } else {
        Err(DeviceError::not_found(device, path))
    }
}

fn require_absent(tree: &DeviceTree, device: DeviceId, path: &str) -> Result<(), DeviceError> {
    if tree.exists(path) {
        Err(DeviceError::transport(device, format!("Already exists: {}", path)))
    } else {
        Ok(())
    }
}

impl DeviceTransport for InMemoryTransport {
    async fn open_device(&self, device: DeviceId) -> Result<DeviceInfo, DeviceError> {
        let _call = self.begin(device, format!("open_device {}", device));
        self.pause().await;
        self.with_tree(device, |tree| {
            tree.open = true;
            Ok(tree.info.clone())
        })
    }

    async fn close_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let _call = self.begin(device, format!("close_device {}", device));
        self.pause().await;
        self.with_tree(device, |tree| {
            tree.open = false;
            Ok(())
        })
    }

    async fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, DeviceError> {
        let _call = self.begin(device, format!("device_info {}", device));
        self.pause().await;
        self.with_tree(device, |tree| {
            if tree.open {
                Ok(tree.info.clone())
            } else {
                Err(DeviceError::transport(device, "Device is not open"))
            }
        })
    }

    async fn list_directory(&self, device: DeviceId, path: &str) -> Result<Vec<FileInfo>, DeviceError> {
        let path = normalize_path(path);
        let _call = self.begin(device, format!("list_directory {} {}", device, path));
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_failure(device, &[&path])?;

        self.with_tree(device, |tree| {
            require_dir(tree, device, &path)?;
            Ok(tree
                .nodes
                .iter()
                .filter(|(key, _)| key.as_str() != "/" && parent_path(key) == path)
                .filter_map(|(key, node)| {
                    let name = file_name(key)?;
                    Some(if node.is_dir {
                        FileInfo::dir(name, node.date)
                    } else {
                        FileInfo::file(name, node.data.len() as u64, node.date)
                    })
                })
                .collect())
        })
    }

    async fn download_file(
        &self,
        device: DeviceId,
        src: &str,
        size: u64,
        dest: &Path,
        progress: ProgressSender,
    ) -> Result<(), DeviceError> {
        let src = normalize_path(src);
        let _call = self.begin(device, format!("download_file {} {}", device, src));
        self.pause().await;
        self.check_failure(device, &[&src])?;

        let data = self.with_tree(device, |tree| match tree.nodes.get(&src) {
            Some(node) if !node.is_dir => Ok(node.data.clone()),
            Some(_) => Err(DeviceError::transport(device, format!("Is a directory: {}", src))),
            None => Err(DeviceError::not_found(device, src.as_str())),
        })?;
        if data.len() as u64 != size {
            debug!("Size mismatch for {}: expected {}, device has {}", src, size, data.len());
        }

        self.stream_progress(device, data.len() as u64, &progress).await;
        tokio::fs::write(dest, &data).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        device: DeviceId,
        src: &Path,
        dest_dir: &str,
        progress: ProgressSender,
    ) -> Result<(), DeviceError> {
        let dest_dir = normalize_path(dest_dir);
        let _call = self.begin(device, format!("upload_file {} {} {}", device, src.display(), dest_dir));
        self.pause().await;
        self.check_failure(device, &[&dest_dir])?;

        let name = src
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DeviceError::Io {
                message: format!("Not a file path: {}", src.display()),
            })?
            .to_string();
        let data = tokio::fs::read(src).await?;
        self.with_tree(device, |tree| require_dir(tree, device, &dest_dir))?;

        self.stream_progress(device, data.len() as u64, &progress).await;

        let dest = join_path(&dest_dir, &name);
        self.with_tree(device, |tree| {
            require_dir(tree, device, &dest_dir)?;
            if tree.is_dir(&dest) {
                return Err(DeviceError::transport(device, format!("Is a directory: {}", dest)));
            }
            tree.nodes.insert(
                dest,
                Node {
                    is_dir: false,
                    data,
                    date: now_secs(),
                },
            );
            Ok(())
        })
    }

    async fn upload_os(&self, device: DeviceId, src: &Path, progress: ProgressSender) -> Result<(), DeviceError> {
        let _call = self.begin(device, format!("upload_os {} {}", device, src.display()));
        self.pause().await;

        let data = tokio::fs::read(src).await?;
        self.with_tree(device, |_| Ok(()))?;
        self.stream_progress(device, data.len() as u64, &progress).await;
        Ok(())
    }

    async fn delete_file(&self, device: DeviceId, path: &str) -> Result<(), DeviceError> {
        let path = normalize_path(path);
        let _call = self.begin(device, format!("delete_file {} {}", device, path));
        self.pause().await;
        self.check_failure(device, &[&path])?;

        self.with_tree(device, |tree| match tree.nodes.get(&path).map(|node| node.is_dir) {
            Some(true) => Err(DeviceError::transport(device, format!("Is a directory: {}", path))),
            Some(false) => {
                tree.nodes.remove(&path);
                Ok(())
            }
            None => Err(DeviceError::not_found(device, path.as_str())),
        })
    }

    async fn delete_dir(&self, device: DeviceId, path: &str) -> Result<(), DeviceError> {
        let path = normalize_path(path);
        let _call = self.begin(device, format!("delete_dir {} {}", device, path));
        self.pause().await;
        self.check_failure(device, &[&path])?;

        self.with_tree(device, |tree| {
            if path == "/" {
                return Err(DeviceError::transport(device, "Can't delete the root directory"));
            }
            require_dir(tree, device, &path)?;
            for key in tree.subtree_keys(&path) {
                tree.nodes.remove(&key);
            }
            Ok(())
        })
    }

    async fn create_dir(&self, device: DeviceId, path: &str) -> Result<(), DeviceError> {
        let path = normalize_path(path);
        let _call = self.begin(device, format!("create_dir {} {}", device, path));
        self.pause().await;
        self.check_failure(device, &[&path])?;

        self.with_tree(device, |tree| {
            require_dir(tree, device, &parent_path(&path))?;
            require_absent(tree, device, &path)?;
            tree.nodes.insert(
                path.clone(),
                Node {
                    is_dir: true,
                    data: Vec::new(),
                    date: now_secs(),
                },
            );
            Ok(())
        })
    }

    async fn move_path(&self, device: DeviceId, src: &str, dest: &str) -> Result<(), DeviceError> {
        let (src, dest) = (normalize_path(src), normalize_path(dest));
        let _call = self.begin(device, format!("move_path {} {} {}", device, src, dest));
        self.pause().await;
        self.check_failure(device, &[&src, &dest])?;

        self.with_tree(device, |tree| {
            if !tree.nodes.contains_key(&src) {
                return Err(DeviceError::not_found(device, src.as_str()));
            }
            if dest.starts_with(&format!("{}/", src)) {
                return Err(DeviceError::transport(device, format!("Can't place {} inside itself", src)));
            }
            require_dir(tree, device, &parent_path(&dest))?;
            require_absent(tree, device, &dest)?;
            for key in tree.subtree_keys(&src) {
                if let Some(node) = tree.nodes.remove(&key) {
                    let moved = format!("{}{}", dest, &key[src.len()..]);
                    tree.nodes.insert(moved, node);
                }
            }
            Ok(())
        })
    }

    async fn copy_path(&self, device: DeviceId, src: &str, dest: &str) -> Result<(), DeviceError> {
        let (src, dest) = (normalize_path(src), normalize_path(dest));
        let _call = self.begin(device, format!("copy_path {} {} {}", device, src, dest));
        self.pause().await;
        self.check_failure(device, &[&src, &dest])?;

        self.with_tree(device, |tree| {
            if !tree.nodes.contains_key(&src) {
                return Err(DeviceError::not_found(device, src.as_str()));
            }
            if dest.starts_with(&format!("{}/", src)) {
                return Err(DeviceError::transport(device, format!("Can't place {} inside itself", src)));
            }
            require_dir(tree, device, &parent_path(&dest))?;
            require_absent(tree, device, &dest)?;
            for key in tree.subtree_keys(&src) {
                if let Some(node) = tree.nodes.get(&key).cloned() {
                    let copied = format!("{}{}", dest, &key[src.len()..]);
                    tree.nodes.insert(copied, node);
                }
            }
            Ok(())
        })
    }
}
