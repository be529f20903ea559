//! Transport Provider Abstraction
//!
//! The radio stack is an external collaborator. It knows which devices are
//! bonded, can remove a bond, scans for nearby devices, and turns an accepted
//! or dialed connection into a bidirectional byte stream. Everything above
//! this seam only sees `BoxedStream`s and `TransportEvent`s.

use crate::{DeviceRecord, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Well-known service identifier both ends listen and dial on
pub const PEERLINK_SERVICE_UUID: Uuid = uuid::uuid!("51fa2934-1a5c-446f-835b-ec90985c6dc7");

/// A bidirectional byte stream produced by a transport
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// Owned, type-erased link stream
pub type BoxedStream = Box<dyn LinkStream>;

/// Identity of the local adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAdapter {
    /// Adapter name, if the platform exposes one
    pub name: Option<String>,
    /// Adapter hardware address, if the platform exposes one
    pub address: Option<String>,
}

impl LocalAdapter {
    /// Adapter with both name and address
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: Some(address.into()),
        }
    }
}

/// Events raised by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A device was seen nearby while scanning
    DeviceFound(DeviceRecord),

    /// A link to a device came up or went down at the transport level
    BondStateChanged {
        /// The device whose link changed
        device: DeviceRecord,
        /// New link state
        connected: bool,
    },

    /// Scanning stopped
    DiscoveryFinished,
}

/// Listening endpoint returned by `TransportProvider::listen`
#[async_trait]
pub trait ConnectionListener: Send {
    /// Wait for the next inbound connection
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint fails or was closed. The listener
    /// is not usable afterwards.
    async fn accept(&mut self) -> Result<(BoxedStream, DeviceRecord)>;

    /// Stop listening
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The radio stack seen from the session layer
#[async_trait]
pub trait TransportProvider: Send + Sync + Debug {
    /// Identity of the local adapter
    fn local_adapter(&self) -> LocalAdapter;

    /// Devices currently bonded at the transport level
    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Remove the bond with a device
    ///
    /// # Errors
    ///
    /// Returns `UnpairFailure` if the transport refuses.
    async fn remove_bond(&self, address: &str) -> Result<()>;

    /// Whether the transport currently has a link to the device
    async fn is_connected(&self, address: &str) -> bool;

    /// Open a listening endpoint on a service identifier
    async fn listen(&self, service_id: Uuid) -> Result<Box<dyn ConnectionListener>>;

    /// Dial a device on a service identifier
    async fn connect(&self, address: &str, service_id: Uuid) -> Result<BoxedStream>;

    /// Start scanning for nearby devices
    async fn start_discovery(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_discovery(&self) -> Result<()>;

    /// Receive discovery and bond-state events
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid() {
        assert_eq!(
            PEERLINK_SERVICE_UUID.to_string(),
            "51fa2934-1a5c-446f-835b-ec90985c6dc7"
        );
    }

    #[test]
    fn test_local_adapter() {
        let adapter = LocalAdapter::new("desk", "00:11:22:33:44:55");
        assert_eq!(adapter.name.as_deref(), Some("desk"));
        assert_eq!(LocalAdapter::default().address, None);
    }
}
