//! TCP Transport
//!
//! Reaches peers over TCP using a static peer table. Each entry maps a
//! device address to the socket it serves on; entries marked `bonded`
//! make up the bonded set. An inbound connection is attributed to a peer
//! only when exactly one table entry has its source IP; otherwise it is
//! keyed by the remote socket address.

use super::{
    lock, BoxedStream, ConnectionListener, LinkTracker, LocalAdapter, TransportEvent,
    TransportProvider,
};
use crate::{DeviceRecord, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};
use uuid::Uuid;

/// Default timeout for TCP connects
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

fn default_bonded() -> bool {
    true
}

/// A known peer reachable over TCP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPeer {
    /// Device address used as the registry key
    pub address: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Socket the peer listens on
    pub socket_addr: SocketAddr,
    /// Whether the peer counts as bonded
    #[serde(default = "default_bonded")]
    pub bonded: bool,
}

impl TcpPeer {
    fn record(&self) -> DeviceRecord {
        let record = DeviceRecord::new(&self.address);
        match self.name.as_deref() {
            Some(name) => record.with_name(name),
            None => record,
        }
    }
}

#[derive(Debug, Default)]
struct TcpState {
    unbonded: HashSet<String>,
    discovering: bool,
}

/// Transport over plain TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    adapter: LocalAdapter,
    listen_addr: SocketAddr,
    peers: Arc<Vec<TcpPeer>>,
    state: Arc<Mutex<TcpState>>,
    links: Arc<LinkTracker>,
}

impl TcpTransport {
    /// Create a transport serving on `listen_addr`
    pub fn new(adapter: LocalAdapter, listen_addr: SocketAddr, peers: Vec<TcpPeer>) -> Self {
        Self {
            adapter,
            listen_addr,
            peers: Arc::new(peers),
            state: Arc::new(Mutex::new(TcpState::default())),
            links: Arc::new(LinkTracker::default()),
        }
    }

    fn peer(&self, address: &str) -> Option<&TcpPeer> {
        self.peers.iter().find(|p| p.address == address)
    }

    fn is_bonded(&self, peer: &TcpPeer) -> bool {
        peer.bonded && !lock(&self.state).unbonded.contains(&peer.address)
    }
}

#[async_trait]
impl TransportProvider for TcpTransport {
    fn local_adapter(&self) -> LocalAdapter {
        self.adapter.clone()
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self
            .peers
            .iter()
            .filter(|p| self.is_bonded(p))
            .map(|p| p.record().with_connected(self.links.is_linked(&p.address)))
            .collect())
    }

    async fn remove_bond(&self, address: &str) -> Result<()> {
        let peer = self
            .peer(address)
            .filter(|p| self.is_bonded(p))
            .ok_or_else(|| ProtocolError::DeviceNotFound(address.to_string()))?;

        lock(&self.state).unbonded.insert(peer.address.clone());
        info!("Bond with {} removed until restart", address);
        Ok(())
    }

    async fn is_connected(&self, address: &str) -> bool {
        self.links.is_linked(address)
    }

    async fn listen(&self, service_id: Uuid) -> Result<Box<dyn ConnectionListener>> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding listener"))?;
        info!(
            "Listening for {} on {}",
            service_id,
            listener.local_addr().unwrap_or(self.listen_addr)
        );

        Ok(Box::new(TcpConnectionListener {
            listener,
            transport: self.clone(),
        }))
    }

    async fn connect(&self, address: &str, service_id: Uuid) -> Result<BoxedStream> {
        let peer = self
            .peer(address)
            .ok_or_else(|| ProtocolError::DeviceNotFound(address.to_string()))?;
        debug!("Connecting to {} ({}) for {}", address, peer.socket_addr, service_id);

        let stream = timeout(TCP_TIMEOUT, TcpStream::connect(peer.socket_addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", address)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", peer.socket_addr);
        Ok(self.links.track(stream, peer.record()))
    }

    async fn start_discovery(&self) -> Result<()> {
        lock(&self.state).discovering = true;
        for peer in self.peers.iter() {
            self.links.emit(TransportEvent::DeviceFound(
                peer.record().with_connected(self.links.is_linked(&peer.address)),
            ));
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        let was_discovering = std::mem::take(&mut lock(&self.state).discovering);
        if was_discovering {
            self.links.emit(TransportEvent::DiscoveryFinished);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.links.subscribe()
    }
}

impl TcpTransport {
    /// Record for an inbound connection from `remote_addr`
    ///
    /// The source port of an inbound connection is ephemeral, so several
    /// peers sharing a host cannot be told apart.
    fn identify(&self, remote_addr: SocketAddr) -> DeviceRecord {
        let mut candidates = self
            .peers
            .iter()
            .filter(|p| p.socket_addr.ip() == remote_addr.ip());
        match (candidates.next(), candidates.next()) {
            (Some(peer), None) => peer.record(),
            (Some(_), Some(_)) => {
                debug!("{} matches several peers, leaving it unattributed", remote_addr);
                DeviceRecord::new(remote_addr.to_string())
            }
            _ => DeviceRecord::new(remote_addr.to_string()),
        }
    }
}

struct TcpConnectionListener {
    listener: TcpListener,
    transport: TcpTransport,
}

#[async_trait]
impl ConnectionListener for TcpConnectionListener {
    async fn accept(&mut self) -> Result<(BoxedStream, DeviceRecord)> {
        let (stream, remote_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "accepting connection"))?;
        stream.set_nodelay(true)?;

        let remote = self.transport.identify(remote_addr);
        debug!("Accepted {} from {}", remote.address, remote_addr);

        Ok((self.transport.links.track(stream, remote.clone()), remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PEERLINK_SERVICE_UUID;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_connect_and_accept() {
        let server_addr = free_addr().await;
        let server = TcpTransport::new(
            LocalAdapter::new("server", "SS"),
            server_addr,
            vec![TcpPeer {
                address: "CC".to_string(),
                name: Some("client".to_string()),
                socket_addr: "127.0.0.1:1".parse().unwrap(),
                bonded: true,
            }],
        );
        let client = TcpTransport::new(
            LocalAdapter::new("client", "CC"),
            "127.0.0.1:0".parse().unwrap(),
            vec![TcpPeer {
                address: "SS".to_string(),
                name: Some("server".to_string()),
                socket_addr: server_addr,
                bonded: true,
            }],
        );

        let mut listener = server.listen(PEERLINK_SERVICE_UUID).await.unwrap();
        let server_task = tokio::spawn(async move {
            let (mut stream, remote) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            (remote, buf)
        });

        let mut stream = client.connect("SS", PEERLINK_SERVICE_UUID).await.unwrap();
        assert!(client.is_connected("SS").await);
        stream.write_all(b"hello").await.unwrap();

        let (remote, buf) = server_task.await.unwrap();
        assert_eq!(remote.address, "CC");
        assert_eq!(&buf, b"hello");

        drop(stream);
        assert!(!client.is_connected("SS").await);
    }

    #[tokio::test]
    async fn test_connect_unknown_peer() {
        let transport = TcpTransport::new(
            LocalAdapter::default(),
            "127.0.0.1:0".parse().unwrap(),
            Vec::new(),
        );
        let err = transport
            .connect("nobody", PEERLINK_SERVICE_UUID)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_bonded_set_and_unbond() {
        let transport = TcpTransport::new(
            LocalAdapter::default(),
            "127.0.0.1:0".parse().unwrap(),
            vec![
                TcpPeer {
                    address: "A".to_string(),
                    name: None,
                    socket_addr: "127.0.0.1:1".parse().unwrap(),
                    bonded: true,
                },
                TcpPeer {
                    address: "B".to_string(),
                    name: None,
                    socket_addr: "127.0.0.1:2".parse().unwrap(),
                    bonded: false,
                },
            ],
        );

        let bonded = transport.bonded_devices().await.unwrap();
        assert_eq!(bonded.len(), 1);
        assert_eq!(bonded[0].address, "A");

        transport.remove_bond("A").await.unwrap();
        assert!(transport.bonded_devices().await.unwrap().is_empty());
        assert!(transport.remove_bond("B").await.is_err());
    }

    #[test]
    fn test_inbound_attribution() {
        let peer = |address: &str, socket_addr: &str| TcpPeer {
            address: address.to_string(),
            name: None,
            socket_addr: socket_addr.parse().unwrap(),
            bonded: true,
        };
        let transport = TcpTransport::new(
            LocalAdapter::default(),
            "127.0.0.1:0".parse().unwrap(),
            vec![
                peer("A", "127.0.0.1:4100"),
                peer("B", "127.0.0.1:4200"),
                peer("C", "10.0.0.3:4100"),
            ],
        );

        let shared_host = transport.identify("127.0.0.1:53000".parse().unwrap());
        assert_eq!(shared_host.address, "127.0.0.1:53000");

        let single = transport.identify("10.0.0.3:53000".parse().unwrap());
        assert_eq!(single.address, "C");

        let stranger = transport.identify("10.0.0.9:53000".parse().unwrap());
        assert_eq!(stranger.address, "10.0.0.9:53000");
    }

    #[test]
    fn test_peer_table_from_toml() {
        let peer: TcpPeer =
            toml::from_str("address = \"AA\"\nsocket_addr = \"10.0.0.2:4100\"\n").unwrap();
        assert!(peer.bonded);
        assert!(peer.name.is_none());
    }
}
