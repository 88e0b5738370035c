//! Registry of attached devices and the current selection.

use log::{debug, info};
use std::collections::{BTreeMap, HashSet};

use super::types::{DeviceId, DeviceInfo, DeviceRecord};

/// Result of reconciling the registry against a fresh enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChanges {
    pub added: Vec<DeviceRecord>,
    pub removed: Vec<DeviceId>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Known devices, ordered by id, plus which one the browser is showing.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceRecord>,
    selected: Option<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a device. The first device added becomes selected.
    ///
    /// Returns `true` if the device wasn't known before.
    pub fn add(&mut self, record: DeviceRecord) -> bool {
        let id = record.id;
        let is_new = self.devices.insert(id, record).is_none();
        if self.selected.is_none() {
            self.selected = Some(id);
        }
        if is_new {
            info!("Device added: {}", id);
        }
        is_new
    }

    /// Removes a device. If it was selected, the selection moves to the first
    /// remaining device (or none).
    pub fn remove(&mut self, id: DeviceId) -> Option<DeviceRecord> {
        let removed = self.devices.remove(&id)?;
        if self.selected == Some(id) {
            self.selected = self.devices.keys().next().copied();
            debug!("Selection moved to {:?} after removing {}", self.selected, id);
        }
        info!("Device removed: {}", id);
        Some(removed)
    }

    /// Selects a device. Unknown ids are ignored and return `false`.
    pub fn select(&mut self, id: Option<DeviceId>) -> bool {
        match id {
            Some(id) if !self.devices.contains_key(&id) => false,
            _ => {
                self.selected = id;
                true
            }
        }
    }

    pub fn selected(&self) -> Option<&DeviceRecord> {
        self.selected.and_then(|id| self.devices.get(&id))
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    pub fn list(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }

    /// Stores the info reported when the device was opened.
    pub fn set_info(&mut self, id: DeviceId, info: DeviceInfo) -> bool {
        match self.devices.get_mut(&id) {
            Some(record) => {
                record.info = Some(info);
                true
            }
            None => false,
        }
    }

    /// Forgets the info of a closed device. Returns `false` if it wasn't known.
    pub fn clear_info(&mut self, id: DeviceId) -> bool {
        match self.devices.get_mut(&id) {
            Some(record) => {
                record.info = None;
                true
            }
            None => false,
        }
    }

    /// Brings the registry in line with the set of currently attached devices.
    ///
    /// Devices no longer attached are removed, newly attached ones are added, and
    /// devices present in both keep their existing record (including opened info).
    pub fn reconcile(&mut self, current: Vec<DeviceRecord>) -> DeviceChanges {
        let current_ids: HashSet<DeviceId> = current.iter().map(|record| record.id).collect();

        let removed: Vec<DeviceId> = self
            .devices
            .keys()
            .filter(|id| !current_ids.contains(id))
            .copied()
            .collect();
        for id in &removed {
            self.remove(*id);
        }

        let mut added = Vec::new();
        for record in current {
            if !self.devices.contains_key(&record.id) {
                self.add(record.clone());
                added.push(record);
            }
        }

        DeviceChanges { added, removed }
    }
}
