//! Paired Device Store
//!
//! Persistent table of paired devices keyed by address. The registry is the
//! only writer; it reconciles the table against the transport's bonded set
//! and publishes it as the paired-device list.
//!
//! Two implementations are provided:
//! - `MemoryDeviceStore`: process-local, for tests and embedding
//! - `JsonDeviceStore`: a JSON file rewritten after every change

use crate::{DeviceRecord, ProtocolError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Storage for paired-device records
#[async_trait]
pub trait DeviceStore: Send + Sync + Debug {
    /// All records, most recently connected first
    async fn list_paired(&self) -> Result<Vec<DeviceRecord>>;

    /// Insert a record; returns false and changes nothing if the address exists
    async fn insert(&self, record: DeviceRecord) -> Result<bool>;

    /// Delete by address; returns whether a record was removed
    async fn delete_by_address(&self, address: &str) -> Result<bool>;

    /// Set the connected flag, stamping the connect time when it becomes true
    async fn update_connected(&self, address: &str, connected: bool) -> Result<()>;

    /// Rename a device
    async fn update_name(&self, address: &str, name: &str) -> Result<()>;

    /// Record whether the device acted as master
    async fn update_master(&self, address: &str, is_master: bool) -> Result<()>;

    /// The first record flagged connected, if any
    async fn currently_connected(&self) -> Result<Option<DeviceRecord>>;
}

/// In-memory table shared by both stores
#[derive(Debug, Default)]
struct RecordTable {
    records: Vec<DeviceRecord>,
}

impl RecordTable {
    fn list(&self) -> Vec<DeviceRecord> {
        let mut records = self.records.clone();
        records.sort_by(|a, b| b.last_connected_at.cmp(&a.last_connected_at));
        records
    }

    fn insert(&mut self, record: DeviceRecord) -> bool {
        if self.records.iter().any(|r| r.same_device(&record)) {
            return false;
        }
        self.records.push(record);
        true
    }

    fn delete(&mut self, address: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.address != address);
        self.records.len() != before
    }

    fn get_mut(&mut self, address: &str) -> Result<&mut DeviceRecord> {
        self.records
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| ProtocolError::DeviceNotFound(address.to_string()))
    }

    fn set_connected(&mut self, address: &str, connected: bool) -> Result<()> {
        let record = self.get_mut(address)?;
        if connected {
            record.mark_connected();
        } else {
            record.mark_disconnected();
        }
        Ok(())
    }

    fn set_name(&mut self, address: &str, name: &str) -> Result<()> {
        let record = self.get_mut(address)?;
        record.name = Some(name.to_string()).filter(|n| !n.trim().is_empty());
        Ok(())
    }

    fn set_master(&mut self, address: &str, is_master: bool) -> Result<()> {
        self.get_mut(address)?.is_master = is_master;
        Ok(())
    }

    fn connected(&self) -> Option<DeviceRecord> {
        self.records.iter().find(|r| r.is_connected).cloned()
    }
}

/// Process-local device store
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    table: RwLock<RecordTable>,
}

impl MemoryDeviceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with records
    pub fn with_records(records: Vec<DeviceRecord>) -> Self {
        let mut table = RecordTable::default();
        for record in records {
            table.insert(record);
        }
        Self {
            table: RwLock::new(table),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn list_paired(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.table.read().await.list())
    }

    async fn insert(&self, record: DeviceRecord) -> Result<bool> {
        Ok(self.table.write().await.insert(record))
    }

    async fn delete_by_address(&self, address: &str) -> Result<bool> {
        Ok(self.table.write().await.delete(address))
    }

    async fn update_connected(&self, address: &str, connected: bool) -> Result<()> {
        self.table.write().await.set_connected(address, connected)
    }

    async fn update_name(&self, address: &str, name: &str) -> Result<()> {
        self.table.write().await.set_name(address, name)
    }

    async fn update_master(&self, address: &str, is_master: bool) -> Result<()> {
        self.table.write().await.set_master(address, is_master)
    }

    async fn currently_connected(&self) -> Result<Option<DeviceRecord>> {
        Ok(self.table.read().await.connected())
    }
}

/// Device store backed by a JSON file
#[derive(Debug)]
pub struct JsonDeviceStore {
    path: PathBuf,
    table: RwLock<RecordTable>,
}

impl JsonDeviceStore {
    /// Open the store at `path`, loading existing records
    ///
    /// Connected flags are cleared on load since no link survives a restart.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut table = RecordTable::default();
        if path.exists() {
            let json = fs::read_to_string(&path)?;
            let records: Vec<DeviceRecord> = serde_json::from_str(&json)?;
            for record in records {
                table.insert(record.with_connected(false));
            }
            info!("Loaded {} paired devices from {:?}", table.records.len(), path);
        } else {
            debug!("No existing device registry at {:?}", path);
        }

        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    /// Location of the registry file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, table: &RecordTable) -> Result<()> {
        let json = serde_json::to_string_pretty(&table.records)?;
        tokio::fs::write(&self.path, json).await?;
        debug!("Saved device registry to {:?}", self.path);
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn list_paired(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.table.read().await.list())
    }

    async fn insert(&self, record: DeviceRecord) -> Result<bool> {
        let mut table = self.table.write().await;
        let inserted = table.insert(record);
        if inserted {
            self.save(&table).await?;
        }
        Ok(inserted)
    }

    async fn delete_by_address(&self, address: &str) -> Result<bool> {
        let mut table = self.table.write().await;
        let deleted = table.delete(address);
        if deleted {
            self.save(&table).await?;
        }
        Ok(deleted)
    }

    async fn update_connected(&self, address: &str, connected: bool) -> Result<()> {
        let mut table = self.table.write().await;
        table.set_connected(address, connected)?;
        self.save(&table).await
    }

    async fn update_name(&self, address: &str, name: &str) -> Result<()> {
        let mut table = self.table.write().await;
        table.set_name(address, name)?;
        self.save(&table).await
    }

    async fn update_master(&self, address: &str, is_master: bool) -> Result<()> {
        let mut table = self.table.write().await;
        table.set_master(address, is_master)?;
        self.save(&table).await
    }

    async fn currently_connected(&self) -> Result<Option<DeviceRecord>> {
        Ok(self.table.read().await.connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn record(address: &str, minutes_ago: i64) -> DeviceRecord {
        let mut record = DeviceRecord::new(address).with_name(format!("dev-{}", address));
        record.last_connected_at = Utc::now() - Duration::minutes(minutes_ago);
        record
    }

    #[tokio::test]
    async fn test_insert_ignores_duplicates() {
        let store = MemoryDeviceStore::new();
        assert!(store.insert(record("A", 0)).await.unwrap());
        assert!(!store
            .insert(DeviceRecord::new("A").with_name("other"))
            .await
            .unwrap());

        let records = store.list_paired().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("dev-A"));
    }

    #[tokio::test]
    async fn test_list_most_recent_first() {
        let store = MemoryDeviceStore::with_records(vec![
            record("old", 30),
            record("new", 1),
            record("mid", 10),
        ]);
        let order: Vec<_> = store
            .list_paired()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.address)
            .collect();
        assert_eq!(order, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_updates() {
        let store = MemoryDeviceStore::with_records(vec![record("A", 60)]);
        let before = store.list_paired().await.unwrap()[0].last_connected_at;

        store.update_connected("A", true).await.unwrap();
        store.update_name("A", "Renamed").await.unwrap();
        store.update_master("A", true).await.unwrap();

        let connected = store.currently_connected().await.unwrap().unwrap();
        assert_eq!(connected.name.as_deref(), Some("Renamed"));
        assert!(connected.is_master);
        assert!(connected.last_connected_at > before);

        store.update_connected("A", false).await.unwrap();
        assert!(store.currently_connected().await.unwrap().is_none());

        assert!(matches!(
            store.update_name("missing", "x").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryDeviceStore::with_records(vec![record("A", 0), record("B", 0)]);
        assert!(store.delete_by_address("A").await.unwrap());
        assert!(!store.delete_by_address("A").await.unwrap());
        assert_eq!(store.list_paired().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_store_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("devices.json");

        {
            let store = JsonDeviceStore::open(&path).unwrap();
            store.insert(record("A", 0)).await.unwrap();
            store.insert(record("B", 5)).await.unwrap();
            store.update_connected("A", true).await.unwrap();
            store.update_name("B", "Laptop").await.unwrap();
        }

        let store = JsonDeviceStore::open(&path).unwrap();
        let records = store.list_paired().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.is_connected));
        assert!(records
            .iter()
            .any(|r| r.address == "B" && r.name.as_deref() == Some("Laptop")));
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("devices.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonDeviceStore::open(&path),
            Err(ProtocolError::Json(_))
        ));
    }
}
