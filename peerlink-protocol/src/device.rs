//! Device Records
//!
//! A `DeviceRecord` identifies a remote endpoint across every list the
//! service keeps (scanned, paired, connected). The `address` is the stable
//! hardware identifier and the only key; names are display data and may be
//! missing or renamed at any time.
//!
//! ## Lifecycle
//!
//! 1. **Discovered**: seen nearby through a discovery event
//! 2. **Bonded**: paired at the transport level and persisted in the store
//! 3. **Connected**: a session or transport link is up
//! 4. **Removed**: unpaired, or no longer in the bonded set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Display name for devices that did not report one
pub const UNIDENTIFIED_NAME: &str = "Unidentified";

/// Placeholder sender address when the local adapter has none
pub const UNIDENTIFIED_ADDRESS: &str = "Unidentified address";

/// Identity and connection status of a remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Name reported by the device, if any
    #[serde(default)]
    pub name: Option<String>,

    /// Stable hardware address, unique key
    pub address: String,

    /// Whether a link to the device is currently up
    #[serde(default)]
    pub is_connected: bool,

    /// Whether the remote side acted as master in the last session
    #[serde(default)]
    pub is_master: bool,

    /// When the device was last connected (or first recorded)
    pub last_connected_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a disconnected record for an address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            is_connected: false,
            is_master: false,
            last_connected_at: Utc::now(),
        }
    }

    /// Set the display name; blank names count as absent
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = if name.trim().is_empty() { None } else { Some(name) };
        self
    }

    /// Set the connected flag
    pub fn with_connected(mut self, is_connected: bool) -> Self {
        self.is_connected = is_connected;
        self
    }

    /// Name to show, `"Unidentified"` when the device has none
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNIDENTIFIED_NAME)
    }

    /// Mark device as connected
    pub fn mark_connected(&mut self) {
        self.is_connected = true;
        self.last_connected_at = Utc::now();
        info!("Device {} ({}) connected", self.address, self.display_name());
    }

    /// Mark device as disconnected
    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
        debug!("Device {} ({}) disconnected", self.address, self.display_name());
    }

    /// Same device, regardless of name or status
    pub fn same_device(&self, other: &DeviceRecord) -> bool {
        self.address == other.address
    }
}

/// Ordering applied to the paired-device list before it is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairedOrder {
    /// Ascending by connected flag: disconnected devices first
    #[default]
    DisconnectedFirst,
    /// Connected devices first
    ConnectedFirst,
}

impl PairedOrder {
    /// Stable-sort a device list in place
    pub fn sort(self, devices: &mut [DeviceRecord]) {
        match self {
            PairedOrder::DisconnectedFirst => devices.sort_by_key(|d| d.is_connected),
            PairedOrder::ConnectedFirst => devices.sort_by_key(|d| !d.is_connected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallback() {
        let device = DeviceRecord::new("AA:BB:CC:DD:EE:01");
        assert_eq!(device.display_name(), "Unidentified");

        let device = device.with_name("Pixel");
        assert_eq!(device.display_name(), "Pixel");

        let blank = DeviceRecord::new("AA:BB:CC:DD:EE:02").with_name("  ");
        assert!(blank.name.is_none());
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut device = DeviceRecord::new("AA:BB:CC:DD:EE:01");
        let created = device.last_connected_at;
        assert!(!device.is_connected);

        device.mark_connected();
        assert!(device.is_connected);
        assert!(device.last_connected_at >= created);

        device.mark_disconnected();
        assert!(!device.is_connected);
    }

    #[test]
    fn test_same_device_ignores_name() {
        let a = DeviceRecord::new("AA").with_name("one");
        let b = DeviceRecord::new("AA").with_name("two").with_connected(true);
        assert!(a.same_device(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_paired_order() {
        let mut devices = vec![
            DeviceRecord::new("A").with_connected(true),
            DeviceRecord::new("B"),
            DeviceRecord::new("C").with_connected(true),
            DeviceRecord::new("D"),
        ];

        PairedOrder::DisconnectedFirst.sort(&mut devices);
        let order: Vec<_> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(order, vec!["B", "D", "A", "C"]);

        PairedOrder::ConnectedFirst.sort(&mut devices);
        let order: Vec<_> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(order, vec!["A", "C", "B", "D"]);
    }
}
