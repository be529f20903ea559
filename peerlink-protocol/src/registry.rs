//! Device Registry
//!
//! Keeps the persisted paired-device table consistent with what the
//! transport reports, and publishes three snapshots:
//! - scanned devices seen during discovery
//! - paired devices, sorted by `PairedOrder`
//! - the currently connected device
//!
//! Snapshots are `watch` channels, replaced wholesale on every change.
//! Writes to the store are serialized by one async mutex so a connected flag
//! flips at most once per actual change.

use crate::device::PairedOrder;
use crate::events::EventBus;
use crate::store::DeviceStore;
use crate::transport::TransportProvider;
use crate::{DeviceRecord, ProtocolError, Result};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct RegistryInner {
    store: Arc<dyn DeviceStore>,
    transport: Arc<dyn TransportProvider>,
    events: EventBus,
    order: PairedOrder,
    scanned: watch::Sender<Vec<DeviceRecord>>,
    paired: watch::Sender<Vec<DeviceRecord>>,
    connected: watch::Sender<Option<DeviceRecord>>,
    write_lock: Mutex<()>,
}

/// Bridge between transport events and the device store
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Create a registry; call `reconcile` to load the paired list
    pub fn new(
        store: Arc<dyn DeviceStore>,
        transport: Arc<dyn TransportProvider>,
        events: EventBus,
        order: PairedOrder,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                transport,
                events,
                order,
                scanned: watch::channel(Vec::new()).0,
                paired: watch::channel(Vec::new()).0,
                connected: watch::channel(None).0,
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Observe devices seen during discovery
    pub fn scanned(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.inner.scanned.subscribe()
    }

    /// Observe the paired-device list
    pub fn paired(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.inner.paired.subscribe()
    }

    /// Observe the connected device
    pub fn connected_device(&self) -> watch::Receiver<Option<DeviceRecord>> {
        self.inner.connected.subscribe()
    }

    /// Known record for an address, from the paired or scanned list
    pub fn lookup(&self, address: &str) -> Option<DeviceRecord> {
        self.find_paired(address).or_else(|| {
            self.inner
                .scanned
                .borrow()
                .iter()
                .find(|d| d.address == address)
                .cloned()
        })
    }

    /// Record a device seen nearby; returns false if it was already listed
    pub fn on_device_found(&self, device: DeviceRecord) -> bool {
        let device = device.with_connected(false);
        self.inner.scanned.send_if_modified(move |scanned| {
            if scanned.iter().any(|d| d.same_device(&device)) {
                return false;
            }
            debug!("Scanned {} ({})", device.display_name(), device.address);
            scanned.push(device);
            true
        })
    }

    /// Forget the scanned list
    pub fn clear_scanned(&self) {
        self.inner.scanned.send_if_modified(|scanned| {
            let changed = !scanned.is_empty();
            scanned.clear();
            changed
        });
    }

    /// Apply a transport-level link change
    ///
    /// # Errors
    ///
    /// `UnpairedDevice` if the device is not bonded; it is also published as
    /// a notice and nothing else changes.
    pub async fn on_bond_state_changed(&self, device: DeviceRecord, connected: bool) -> Result<()> {
        let bonded = self.inner.transport.bonded_devices().await?;
        let Some(bonded_record) = bonded.into_iter().find(|d| d.same_device(&device)) else {
            let error = ProtocolError::UnpairedDevice(device.address.clone());
            self.inner.events.notify(error.user_message());
            return Err(error);
        };

        self.reconcile().await?;
        self.set_connected(&device.address, connected).await?;

        let record = self.find_paired(&device.address).unwrap_or(bonded_record);
        let name = record.display_name().to_string();
        if connected {
            self.inner
                .connected
                .send_replace(Some(record.with_connected(true)));
            self.inner.events.notify(format!("Connected to {}", name));
        } else {
            self.clear_connected(&device.address);
            self.inner.events.notify(format!("Disconnected from {}", name));
        }
        Ok(())
    }

    /// Align the persisted table with the bonded set and publish it
    ///
    /// Records no longer bonded are deleted, bonded devices not yet stored
    /// are inserted, and connected flags follow the transport.
    pub async fn reconcile(&self) -> Result<Vec<DeviceRecord>> {
        let _guard = self.inner.write_lock.lock().await;
        let store = &self.inner.store;

        let bonded = self.inner.transport.bonded_devices().await?;
        let persisted = store.list_paired().await?;

        for record in &persisted {
            if !bonded.iter().any(|d| d.same_device(record)) {
                store.delete_by_address(&record.address).await?;
                info!(
                    "Removed {} ({}), no longer bonded",
                    record.display_name(),
                    record.address
                );
            }
        }

        for device in &bonded {
            let linked = self.inner.transport.is_connected(&device.address).await;
            match persisted.iter().find(|r| r.same_device(device)) {
                None => {
                    store
                        .insert(device.clone().with_connected(linked))
                        .await?;
                    info!(
                        "Added bonded device {} ({})",
                        device.display_name(),
                        device.address
                    );
                }
                Some(record) if record.is_connected != linked => {
                    store.update_connected(&device.address, linked).await?;
                }
                Some(_) => {}
            }
        }

        self.publish_paired().await
    }

    /// Rename a paired device
    pub async fn rename(&self, address: &str, new_name: &str) -> Result<()> {
        {
            let _guard = self.inner.write_lock.lock().await;
            self.inner.store.update_name(address, new_name).await?;
            self.publish_paired().await?;
        }

        let renamed = self.find_paired(address);
        self.inner.connected.send_if_modified(|current| match current {
            Some(device) if device.address == address => {
                if let Some(renamed) = renamed {
                    device.name = renamed.name;
                }
                true
            }
            _ => false,
        });
        info!("Renamed {} to {}", address, new_name);
        Ok(())
    }

    /// Remove the bond with a device, then reconcile
    ///
    /// # Errors
    ///
    /// `UnpairFailure` if the transport refuses; a notice is published and
    /// the persisted table is left as it was.
    pub async fn unpair(&self, address: &str) -> Result<()> {
        if let Err(e) = self.inner.transport.remove_bond(address).await {
            let name = self
                .lookup(address)
                .map(|d| d.display_name().to_string())
                .unwrap_or_else(|| address.to_string());
            let error = match e {
                ProtocolError::UnpairFailure(reason) => {
                    warn!("Unpairing {} failed: {}", address, reason);
                    ProtocolError::UnpairFailure(name)
                }
                other => other,
            };
            self.inner.events.notify(error.user_message());
            return Err(error);
        }

        info!("Unpaired {}", address);
        self.reconcile().await?;
        Ok(())
    }

    /// Set the connected flag of a paired device
    ///
    /// Returns whether the flag changed. Unknown addresses are ignored.
    pub async fn set_connected(&self, address: &str, connected: bool) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().await;

        let current = self
            .inner
            .store
            .list_paired()
            .await?
            .into_iter()
            .find(|r| r.address == address);
        match current {
            Some(record) if record.is_connected != connected => {
                self.inner.store.update_connected(address, connected).await?;
                if !connected {
                    self.clear_connected(address);
                }
                self.publish_paired().await?;
                info!(
                    "{} ({}) is now {}",
                    record.display_name(),
                    address,
                    if connected { "connected" } else { "disconnected" }
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Persist a new session with `remote` and publish it as connected
    ///
    /// Inserts the record if missing, stamps the connect time and records
    /// whether the remote side was master.
    pub async fn session_established(
        &self,
        remote: &DeviceRecord,
        remote_is_master: bool,
    ) -> Result<DeviceRecord> {
        let _guard = self.inner.write_lock.lock().await;
        let store = &self.inner.store;

        let exists = store
            .list_paired()
            .await?
            .iter()
            .any(|r| r.same_device(remote));
        if exists {
            store.update_connected(&remote.address, true).await?;
            store
                .update_master(&remote.address, remote_is_master)
                .await?;
        } else {
            let mut record = remote.clone();
            record.is_master = remote_is_master;
            record.mark_connected();
            store.insert(record).await?;
        }

        let paired = self.publish_paired().await?;
        let record = paired
            .into_iter()
            .find(|r| r.same_device(remote))
            .unwrap_or_else(|| remote.clone().with_connected(true));
        self.inner.connected.send_replace(Some(record.clone()));
        Ok(record)
    }

    /// Mark the remote of a closed session disconnected
    pub async fn session_closed(&self, address: &str) -> Result<bool> {
        let changed = self.set_connected(address, false).await?;
        self.clear_connected(address);
        Ok(changed)
    }

    /// The stored record flagged connected, if any
    pub async fn currently_connected(&self) -> Result<Option<DeviceRecord>> {
        self.inner.store.currently_connected().await
    }

    fn find_paired(&self, address: &str) -> Option<DeviceRecord> {
        self.inner
            .paired
            .borrow()
            .iter()
            .find(|d| d.address == address)
            .cloned()
    }

    fn clear_connected(&self, address: &str) {
        self.inner.connected.send_if_modified(|current| {
            if current.as_ref().is_some_and(|d| d.address == address) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    async fn publish_paired(&self) -> Result<Vec<DeviceRecord>> {
        let mut paired = self.inner.store.list_paired().await?;
        self.inner.order.sort(&mut paired);
        self.inner.paired.send_replace(paired.clone());
        Ok(paired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDeviceStore;
    use crate::transport::{MemoryRadio, MemoryTransport};

    struct Fixture {
        transport: MemoryTransport,
        store: Arc<MemoryDeviceStore>,
        events: EventBus,
        registry: DeviceRegistry,
    }

    fn fixture(bonded: &[&str], persisted: &[&str]) -> Fixture {
        let radio = MemoryRadio::new();
        let transport = radio.transport("LOCAL", Some("local"));
        for address in bonded {
            transport.add_bond(
                DeviceRecord::new(*address).with_name(format!("bonded-{}", address)),
            );
        }
        let store = Arc::new(MemoryDeviceStore::with_records(
            persisted
                .iter()
                .map(|a| DeviceRecord::new(*a).with_name(format!("stored-{}", a)))
                .collect(),
        ));
        let events = EventBus::new();
        let registry = DeviceRegistry::new(
            store.clone(),
            Arc::new(transport.clone()),
            events.clone(),
            PairedOrder::DisconnectedFirst,
        );
        Fixture {
            transport,
            store,
            events,
            registry,
        }
    }

    fn addresses(records: &[DeviceRecord]) -> Vec<&str> {
        let mut addresses: Vec<&str> = records.iter().map(|r| r.address.as_str()).collect();
        addresses.sort();
        addresses
    }

    #[tokio::test]
    async fn test_reconcile_deletes_and_inserts() {
        let f = fixture(&["X", "Y"], &["Y", "Z"]);

        let paired = f.registry.reconcile().await.unwrap();
        assert_eq!(addresses(&paired), vec!["X", "Y"]);

        let stored = f.store.list_paired().await.unwrap();
        assert_eq!(addresses(&stored), vec!["X", "Y"]);
        // existing records keep their stored name
        let y = stored.iter().find(|r| r.address == "Y").unwrap();
        assert_eq!(y.name.as_deref(), Some("stored-Y"));

        assert_eq!(addresses(&f.registry.paired().borrow()), vec!["X", "Y"]);
    }

    #[tokio::test]
    async fn test_paired_list_order() {
        let f = fixture(&["A", "B"], &["A", "B"]);
        assert!(f.registry.set_connected("A", true).await.unwrap());

        let paired = f.registry.paired().borrow().clone();
        let order: Vec<_> = paired.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_device_found_is_idempotent() {
        let f = fixture(&[], &[]);
        assert!(f.registry.on_device_found(DeviceRecord::new("N1").with_name("one")));
        assert!(!f
            .registry
            .on_device_found(DeviceRecord::new("N1").with_name("renamed")));
        assert!(f.registry.on_device_found(DeviceRecord::new("N2")));

        let scanned = f.registry.scanned().borrow().clone();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].name.as_deref(), Some("one"));

        f.registry.clear_scanned();
        assert!(f.registry.scanned().borrow().is_empty());
    }

    #[tokio::test]
    async fn test_bond_event_for_unbonded_device() {
        let f = fixture(&["X"], &["X"]);
        f.registry.reconcile().await.unwrap();
        let mut notices = f.events.notices();

        let result = f
            .registry
            .on_bond_state_changed(DeviceRecord::new("STRANGER"), true)
            .await;
        assert!(matches!(result, Err(ProtocolError::UnpairedDevice(_))));
        assert_eq!(
            notices.recv().await.unwrap(),
            "Can't connect to a non-paired device."
        );
        assert!(f.registry.connected_device().borrow().is_none());
        assert!(f.store.currently_connected().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bond_event_updates_connection() {
        let f = fixture(&["X"], &[]);
        let mut notices = f.events.notices();

        f.registry
            .on_bond_state_changed(DeviceRecord::new("X"), true)
            .await
            .unwrap();
        assert_eq!(notices.recv().await.unwrap(), "Connected to bonded-X");
        let connected = f.registry.connected_device().borrow().clone().unwrap();
        assert_eq!(connected.address, "X");
        assert!(f.store.currently_connected().await.unwrap().is_some());

        f.registry
            .on_bond_state_changed(DeviceRecord::new("X"), false)
            .await
            .unwrap();
        assert_eq!(notices.recv().await.unwrap(), "Disconnected from bonded-X");
        assert!(f.registry.connected_device().borrow().is_none());
    }

    #[tokio::test]
    async fn test_set_connected_reports_change_once() {
        let f = fixture(&["X"], &["X"]);
        assert!(f.registry.set_connected("X", true).await.unwrap());
        assert!(!f.registry.set_connected("X", true).await.unwrap());
        assert!(f.registry.set_connected("X", false).await.unwrap());
        assert!(!f.registry.set_connected("X", false).await.unwrap());
        assert!(!f.registry.set_connected("unknown", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename() {
        let f = fixture(&["X"], &["X"]);
        f.registry.reconcile().await.unwrap();

        f.registry.rename("X", "Kitchen tablet").await.unwrap();
        let paired = f.registry.paired().borrow().clone();
        assert_eq!(paired[0].name.as_deref(), Some("Kitchen tablet"));
        assert!(!paired[0].is_connected);

        assert!(matches!(
            f.registry.rename("missing", "x").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unpair() {
        let f = fixture(&["X", "Y"], &["X", "Y"]);
        f.registry.reconcile().await.unwrap();

        f.registry.unpair("X").await.unwrap();
        assert_eq!(addresses(&f.store.list_paired().await.unwrap()), vec!["Y"]);
        assert_eq!(addresses(&f.registry.paired().borrow()), vec!["Y"]);
    }

    #[tokio::test]
    async fn test_unpair_failure_leaves_state() {
        let f = fixture(&["X"], &["X"]);
        f.registry.reconcile().await.unwrap();
        let mut notices = f.events.notices();
        f.transport.fail_next_unbond("busy");

        let result = f.registry.unpair("X").await;
        assert!(matches!(result, Err(ProtocolError::UnpairFailure(_))));
        assert!(notices.recv().await.unwrap().contains("stored-X"));
        assert_eq!(addresses(&f.store.list_paired().await.unwrap()), vec!["X"]);
    }

    #[tokio::test]
    async fn test_session_bookkeeping() {
        let f = fixture(&[], &[]);
        let remote = DeviceRecord::new("R").with_name("remote");

        let record = f.registry.session_established(&remote, true).await.unwrap();
        assert!(record.is_connected);
        assert!(record.is_master);
        assert_eq!(
            f.registry.connected_device().borrow().as_ref().map(|d| d.address.clone()),
            Some("R".to_string())
        );
        assert_eq!(f.registry.currently_connected().await.unwrap().unwrap().address, "R");

        assert!(f.registry.session_closed("R").await.unwrap());
        assert!(!f.registry.session_closed("R").await.unwrap());
        assert!(f.registry.connected_device().borrow().is_none());
    }

    #[tokio::test]
    async fn test_lookup_prefers_paired() {
        let f = fixture(&["X"], &[]);
        f.registry.on_device_found(DeviceRecord::new("X").with_name("scanned"));
        assert_eq!(
            f.registry.lookup("X").unwrap().name.as_deref(),
            Some("scanned")
        );

        f.registry.reconcile().await.unwrap();
        assert_eq!(
            f.registry.lookup("X").unwrap().name.as_deref(),
            Some("bonded-X")
        );
        assert!(f.registry.lookup("nope").is_none());
    }
}
