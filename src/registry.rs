//! The authoritative in-memory device table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::debug;

use crate::device::{Connectivity, Device};
use crate::errors::Error;
use crate::protocol::StateDelta;
use crate::types::DeviceState;

type Result<T> = std::result::Result<T, Error>;

/// The single authoritative mapping from device address to [`Device`].
///
/// The registry is a cheaply cloneable handle; every clone refers to the same
/// table. All mutation goes through its operations, serialized by an internal
/// lock, so readers never observe partial updates. The registry performs no
/// network or disk I/O; persistence is the caller's concern via
/// [`snapshot`](DeviceRegistry::snapshot) and
/// [`load_snapshot`](DeviceRegistry::load_snapshot).
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<HashMap<SocketAddr, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device, or merge it into the existing record for the same
    /// address (see [`Device`] merge semantics).
    pub fn upsert(&self, device: Device) {
        let mut devices = self.inner.lock().unwrap();
        match devices.get_mut(&device.addr) {
            Some(existing) => existing.merge(device),
            None => {
                devices.insert(device.addr, device);
            }
        }
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Device> {
        self.inner.lock().unwrap().get(&addr).cloned()
    }

    /// Snapshot copy of every known device. Ordering is not guaranteed.
    pub fn all(&self) -> Vec<Device> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn remove(&self, addr: SocketAddr) -> Option<Device> {
        self.inner.lock().unwrap().remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Record that a device stopped responding, without deleting it.
    ///
    /// If the device is already unreachable the original observation time is
    /// kept, so retention counts from the first failure.
    pub fn mark_unreachable(&self, addr: SocketAddr, observed_at: SystemTime) {
        if let Some(device) = self.inner.lock().unwrap().get_mut(&addr)
            && device.connectivity == Connectivity::Reachable
        {
            device.connectivity = Connectivity::Unreachable { since: observed_at };
        }
    }

    /// Drop devices that have been unreachable for longer than `retention`.
    ///
    /// Returns the number of devices removed.
    pub fn evict_unreachable(&self, retention: Duration, now: SystemTime) -> usize {
        let mut devices = self.inner.lock().unwrap();
        let before = devices.len();
        devices.retain(|addr, device| match device.connectivity {
            Connectivity::Reachable => true,
            Connectivity::Unreachable { since } => {
                let expired = now
                    .duration_since(since)
                    .map(|age| age > retention)
                    .unwrap_or(false);
                if expired {
                    debug!("evicting unreachable device {addr}");
                }
                !expired
            }
        });
        before - devices.len()
    }

    /// Apply a state-change delta pushed by a device's control session.
    ///
    /// Creates a minimal record if the address is unknown (a session can be
    /// opened for a device that was never discovered). Returns the resulting
    /// state.
    pub(crate) fn apply_delta(
        &self,
        addr: SocketAddr,
        delta: &StateDelta,
        at: SystemTime,
    ) -> DeviceState {
        let mut devices = self.inner.lock().unwrap();
        let device = devices
            .entry(addr)
            .or_insert_with(|| Device::new(addr, at));
        delta.apply_to(&mut device.state);
        if let Some(name) = &delta.name {
            device.name = Some(name.clone());
        }
        device.last_seen = at;
        device.connectivity = Connectivity::Reachable;
        device.state
    }

    /// Serialize every device for the caller's persistent store.
    pub fn snapshot(&self) -> Result<String> {
        let devices = self.all();
        serde_json::to_string(&devices).map_err(Error::JsonDump)
    }

    /// Merge a previously persisted snapshot into the registry.
    ///
    /// Returns the number of records loaded.
    pub fn load_snapshot(&self, snapshot: &str) -> Result<usize> {
        let devices: Vec<Device> = serde_json::from_str(snapshot).map_err(Error::JsonLoad)?;
        let count = devices.len();
        for device in devices {
            self.upsert(device);
        }
        Ok(count)
    }
}
