//! Device registry.
//!
//! Tracks the devices taking part in a scoring session, their declared
//! capabilities and their role. Registering a known id is a reconnect and
//! updates the entry in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable, client-generated device identifier.
pub type DeviceId = String;

/// Form factor reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Tablet => "tablet",
            Self::Mobile => "mobile",
        }
    }
}

/// Role of a device within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Master,
    #[default]
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Declared device capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub touch: bool,
    pub vibration: bool,
    pub camera: bool,
    pub fullscreen: bool,
    pub viewport: Viewport,
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: DeviceId,

    pub device_type: DeviceType,

    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub role: DeviceRole,

    /// When this device (re)connected
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl Device {
    /// Create a secondary device connected now.
    pub fn new(device_id: impl Into<DeviceId>, device_type: DeviceType) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            capabilities: Capabilities::default(),
            role: DeviceRole::Secondary,
            connected_at: chrono::Utc::now(),
        }
    }

    /// Replace the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Check if this device holds the master role.
    pub fn is_master(&self) -> bool {
        self.role == DeviceRole::Master
    }
}

/// Result of a `register` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Known id, entry refreshed
    Updated,
}

/// Devices indexed by id. Iteration order is the id's lexical order.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, or refresh it if the id is already present.
    ///
    /// A reconnecting device keeps its current role; roles follow the master
    /// assignment, not what the client claims.
    pub fn register(&mut self, device: Device) -> Registration {
        match self.devices.get_mut(&device.device_id) {
            Some(existing) => {
                existing.device_type = device.device_type;
                existing.capabilities = device.capabilities;
                existing.connected_at = device.connected_at;
                Registration::Updated
            }
            None => {
                self.devices.insert(device.device_id.clone(), device);
                Registration::Added
            }
        }
    }

    /// Remove a device, returning its entry if it was registered.
    pub fn unregister(&mut self, device_id: &str) -> Option<Device> {
        self.devices.remove(device_id)
    }

    /// Get a device by id.
    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Check if a device is registered.
    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Snapshot of all devices, sorted by id.
    pub fn list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// Device ids in lexical order.
    pub fn ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    /// Replace the whole registry with a broadcast list.
    ///
    /// Returns the ids that were present before but not in `devices`.
    pub fn replace_all(&mut self, devices: Vec<Device>) -> Vec<DeviceId> {
        let incoming: BTreeMap<DeviceId, Device> = devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();

        let departed = self
            .devices
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();

        self.devices = incoming;
        departed
    }

    /// Recompute roles so that only `master` holds `DeviceRole::Master`.
    pub fn set_master(&mut self, master: Option<&str>) {
        for (id, device) in &mut self.devices {
            device.role = if Some(id.as_str()) == master {
                DeviceRole::Master
            } else {
                DeviceRole::Secondary
            };
        }
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
