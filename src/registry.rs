//! In-process device registry.
//!
//! Keeps the set of known devices by id so discovery results can be handed
//! off to the facade layer. This is plain process-local state; any external
//! registry surface sits on top of it.

use dashmap::DashMap;

use crate::core::device::DeviceInfo;
use crate::discovery::DiscoveredDevice;

/// Concurrent map of known devices keyed by `device_id`.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceInfo>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device record. Returns the previous record when
    /// the id was already registered.
    pub fn register(&self, info: DeviceInfo) -> Option<DeviceInfo> {
        self.devices.insert(info.device_id.clone(), info)
    }

    /// Absorb a discovery result, refreshing `last_seen`.
    pub fn absorb(&self, discovered: &DiscoveredDevice) {
        let mut info = discovered.info.clone();
        info.touch();
        self.register(info);
    }

    /// Copy of a device record by id.
    pub fn get(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    /// Remove a device, returning its record.
    pub fn remove(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.remove(device_id).map(|(_, info)| info)
    }

    /// Refresh a device's `last_seen`. Returns false for unknown ids.
    pub fn touch(&self, device_id: &str) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every registered device.
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
