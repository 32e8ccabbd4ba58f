//! Known-device records.

use std::net::SocketAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceState, FeatureSet};

/// Reachability of a device as last observed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Reachable,
    Unreachable { since: SystemTime },
}

/// One known bulb.
///
/// The network address is the identity; everything else is descriptive.
/// Instances are created by the discovery engine or loaded from a persisted
/// snapshot, and updated in place by the registry as new observations arrive.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Device {
    pub(crate) addr: SocketAddr,
    pub(crate) id: Option<u64>,
    pub(crate) name: Option<String>,
    pub(crate) model: Option<String>,
    pub(crate) fw_version: Option<String>,
    pub(crate) features: FeatureSet,
    pub(crate) state: DeviceState,
    pub(crate) last_seen: SystemTime,
    pub(crate) connectivity: Connectivity,
}

impl Device {
    /// Create a bare device record for an address, seen at the given time.
    pub fn new(addr: SocketAddr, seen_at: SystemTime) -> Self {
        Device {
            addr,
            id: None,
            name: None,
            model: None,
            fw_version: None,
            features: FeatureSet::new(),
            state: DeviceState::Unknown,
            last_seen: seen_at,
            connectivity: Connectivity::Reachable,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Vendor-assigned numeric id, if advertised.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn fw_version(&self) -> Option<&str> {
        self.fw_version.as_deref()
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    /// Merge a newer observation of the same device into this record.
    ///
    /// Name and model are immutable once set; identity fields (id, firmware,
    /// features) overlay only when the incoming record carries a value.
    /// State and connectivity always take the incoming observation, and
    /// `last_seen` keeps the newest of the two.
    pub(crate) fn merge(&mut self, other: Device) {
        debug_assert_eq!(self.addr, other.addr);

        if other.id.is_some() {
            self.id = other.id;
        }
        if self.name.is_none() {
            self.name = other.name;
        }
        if self.model.is_none() {
            self.model = other.model;
        }
        if other.fw_version.is_some() {
            self.fw_version = other.fw_version;
        }
        if !other.features.is_empty() {
            self.features = other.features;
        }
        self.state = other.state;
        self.connectivity = other.connectivity;
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}
