//! Device registry and busy flags
//!
//! Maps each announced terminal to the connection currently carrying it. The
//! busy flags sit behind their own lock so admission checks never contend with
//! HELLO/GOODBYE bookkeeping.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::Hello;

/// What core knows about an attached terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub connection_id: u64,
    pub fw_version: u16,
    pub name: String,
    pub bricked: bool,
    pub attached_at: Instant,
}

#[derive(Debug, Default)]
struct Attachments {
    devices: HashMap<u64, DeviceRecord>,
    connections: HashMap<u64, u64>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    attachments: Mutex<Attachments>,
    busy: Mutex<HashSet<u64>>,
}

/// Holds a device's busy flag; dropping it clears the flag.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    registry: &'a DeviceRegistry,
    device_id: u64,
}

impl BusyGuard<'_> {
    pub fn device_id(&self) -> u64 {
        self.device_id
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.registry.busy.lock().remove(&self.device_id);
        debug!("Device {} no longer busy", self.device_id);
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hello` as arriving on `connection_id`.
    ///
    /// Returns the record it replaced, if the device was already attached.
    pub fn register(&self, connection_id: u64, hello: &Hello) -> Option<DeviceRecord> {
        let record = DeviceRecord {
            connection_id,
            fw_version: hello.fw_version,
            name: hello.name.clone(),
            bricked: hello.bricked,
            attached_at: Instant::now(),
        };
        let mut attachments = self.attachments.lock();
        let previous = attachments.devices.insert(hello.device_id, record);
        if let Some(previous) = &previous {
            if previous.connection_id != connection_id {
                attachments.connections.remove(&previous.connection_id);
                warn!(
                    "Device {} moved from connection {} to {}",
                    hello.device_id, previous.connection_id, connection_id
                );
            }
        }
        attachments.connections.insert(connection_id, hello.device_id);
        info!(
            "Device {} active on connection {} (fw {}{})",
            hello.device_id,
            connection_id,
            hello.fw_version,
            if hello.bricked { ", bricked" } else { "" }
        );
        previous
    }

    pub fn deregister(&self, device_id: u64) -> Option<DeviceRecord> {
        let mut attachments = self.attachments.lock();
        let record = attachments.devices.remove(&device_id)?;
        attachments.connections.remove(&record.connection_id);
        info!("Device {} inactive", device_id);
        Some(record)
    }

    /// Detach whichever device `connection_id` carries, if that mapping is still current.
    pub fn deregister_connection(&self, connection_id: u64) -> Option<u64> {
        let mut attachments = self.attachments.lock();
        let device_id = attachments.connections.remove(&connection_id)?;
        let current = attachments
            .devices
            .get(&device_id)
            .is_some_and(|record| record.connection_id == connection_id);
        if current {
            attachments.devices.remove(&device_id);
            info!("Device {} inactive (connection {} closed)", device_id, connection_id);
        }
        current.then_some(device_id)
    }

    pub fn is_active(&self, device_id: u64) -> bool {
        self.attachments.lock().devices.contains_key(&device_id)
    }

    pub fn connection_for(&self, device_id: u64) -> Option<u64> {
        self.attachments.lock().devices.get(&device_id).map(|r| r.connection_id)
    }

    pub fn device_for(&self, connection_id: u64) -> Option<u64> {
        self.attachments.lock().connections.get(&connection_id).copied()
    }

    pub fn record(&self, device_id: u64) -> Option<DeviceRecord> {
        self.attachments.lock().devices.get(&device_id).cloned()
    }

    /// Attached device ids, ascending.
    pub fn devices(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.attachments.lock().devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_busy(&self, device_id: u64) -> bool {
        self.busy.lock().contains(&device_id)
    }

    /// Set the busy flag unless it is already set.
    pub fn try_acquire(&self, device_id: u64) -> Option<BusyGuard<'_>> {
        if !self.busy.lock().insert(device_id) {
            return None;
        }
        debug!("Device {} busy", device_id);
        Some(BusyGuard { registry: self, device_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(device_id: u64) -> Hello {
        Hello { device_id, fw_version: 5, bricked: false, name: "lobby".into() }
    }

    #[test]
    fn register_and_lookup_both_ways() {
        let registry = DeviceRegistry::new();
        assert!(registry.register(7, &hello(42)).is_none());
        assert!(registry.is_active(42));
        assert_eq!(registry.connection_for(42), Some(7));
        assert_eq!(registry.device_for(7), Some(42));
        assert_eq!(registry.record(42).unwrap().fw_version, 5);
    }

    #[test]
    fn stale_connection_does_not_detach_reattached_device() {
        let registry = DeviceRegistry::new();
        registry.register(1, &hello(42));
        let previous = registry.register(2, &hello(42)).unwrap();
        assert_eq!(previous.connection_id, 1);

        assert_eq!(registry.deregister_connection(1), None);
        assert_eq!(registry.connection_for(42), Some(2));
        assert_eq!(registry.deregister_connection(2), Some(42));
        assert!(!registry.is_active(42));
    }

    #[test]
    fn deregister_by_device() {
        let registry = DeviceRegistry::new();
        registry.register(3, &hello(9));
        registry.register(4, &hello(10));
        assert_eq!(registry.devices(), vec![9, 10]);
        assert_eq!(registry.deregister(9).unwrap().connection_id, 3);
        assert_eq!(registry.device_for(3), None);
        assert!(registry.deregister(9).is_none());
    }

    #[test]
    fn busy_flag_is_single_flight_and_cleared_on_drop() {
        let registry = DeviceRegistry::new();
        let guard = registry.try_acquire(42).unwrap();
        assert!(registry.is_busy(42));
        assert!(registry.try_acquire(42).is_none());
        assert!(registry.is_busy(42), "rejected acquire must not clear the flag");
        assert!(registry.try_acquire(43).is_some());
        drop(guard);
        assert!(!registry.is_busy(42));
        assert!(registry.try_acquire(42).is_some());
    }

    #[test]
    fn racing_threads_admit_exactly_one() {
        let registry = std::sync::Arc::new(DeviceRegistry::new());
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // Leak the flag so later threads cannot reacquire it
                    registry.try_acquire(42).map(std::mem::forget).is_some()
                })
            })
            .collect();
        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|a| *a).count();
        assert_eq!(admitted, 1);
    }
}
