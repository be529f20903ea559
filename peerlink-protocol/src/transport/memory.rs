//! In-Process Transport
//!
//! A `MemoryRadio` links any number of `MemoryTransport`s by address. A dial
//! hands the listener one end of a `tokio::io::duplex` pipe, so both sides
//! get a real `AsyncRead + AsyncWrite` stream. Bonds, nearby devices and
//! failures are scripted by the caller.

use super::{
    lock, BoxedStream, ConnectionListener, LinkTracker, LocalAdapter, TransportEvent,
    TransportProvider,
};
use crate::{DeviceRecord, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Buffer size of each in-memory link
const LINK_BUFFER_SIZE: usize = 64 * 1024;

type Incoming = (BoxedStream, DeviceRecord);
type ListenerKey = (String, Uuid);

#[derive(Debug, Default)]
struct RadioInner {
    listeners: HashMap<ListenerKey, mpsc::UnboundedSender<Incoming>>,
    nodes: HashMap<String, Weak<Node>>,
}

/// Shared medium connecting memory transports
#[derive(Debug, Clone, Default)]
pub struct MemoryRadio {
    inner: Arc<Mutex<RadioInner>>,
}

impl MemoryRadio {
    /// Create an empty radio
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new transport with the given adapter identity
    pub fn transport(&self, address: &str, name: Option<&str>) -> MemoryTransport {
        let node = Arc::new(Node {
            adapter: LocalAdapter {
                name: name.map(str::to_string),
                address: Some(address.to_string()),
            },
            state: Mutex::new(NodeState::default()),
            links: Arc::new(LinkTracker::default()),
        });
        lock(&self.inner)
            .nodes
            .insert(address.to_string(), Arc::downgrade(&node));

        MemoryTransport {
            radio: self.clone(),
            node,
        }
    }

    fn node(&self, address: &str) -> Option<Arc<Node>> {
        lock(&self.inner).nodes.get(address).and_then(Weak::upgrade)
    }

    fn listener(&self, key: &ListenerKey) -> Option<mpsc::UnboundedSender<Incoming>> {
        lock(&self.inner)
            .listeners
            .get(key)
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    fn register(&self, key: ListenerKey, tx: mpsc::UnboundedSender<Incoming>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.listeners.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return Err(ProtocolError::Transport(format!(
                "{} is already listening on {}",
                key.0, key.1
            )));
        }
        inner.listeners.insert(key, tx);
        Ok(())
    }

    fn unregister(&self, key: &ListenerKey, tx: &mpsc::UnboundedSender<Incoming>) {
        let mut inner = lock(&self.inner);
        if inner
            .listeners
            .get(key)
            .is_some_and(|current| current.same_channel(tx))
        {
            inner.listeners.remove(key);
        }
    }
}

#[derive(Debug, Default)]
struct NodeState {
    bonded: Vec<DeviceRecord>,
    nearby: Vec<DeviceRecord>,
    discovering: bool,
    fail_next_connect: Option<String>,
    fail_next_accept: Option<String>,
    fail_next_unbond: Option<String>,
}

#[derive(Debug)]
struct Node {
    adapter: LocalAdapter,
    state: Mutex<NodeState>,
    links: Arc<LinkTracker>,
}

impl Node {
    fn address(&self) -> &str {
        self.adapter.address.as_deref().unwrap_or_default()
    }

    /// How this node knows a remote: its bonded record if any
    fn record_for(&self, address: &str, name: Option<&str>) -> DeviceRecord {
        let state = lock(&self.state);
        state
            .bonded
            .iter()
            .find(|d| d.address == address)
            .cloned()
            .unwrap_or_else(|| {
                let record = DeviceRecord::new(address);
                match name {
                    Some(name) => record.with_name(name),
                    None => record,
                }
            })
    }
}

/// Transport endpoint on a `MemoryRadio`
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    radio: MemoryRadio,
    node: Arc<Node>,
}

impl MemoryTransport {
    /// Local address on the radio
    pub fn address(&self) -> &str {
        self.node.address()
    }

    /// Bond two transports with each other
    pub fn bond_with(&self, other: &MemoryTransport) {
        let theirs = DeviceRecord::new(other.address());
        let theirs = match other.node.adapter.name.as_deref() {
            Some(name) => theirs.with_name(name),
            None => theirs,
        };
        self.add_bond(theirs);

        let ours = DeviceRecord::new(self.address());
        let ours = match self.node.adapter.name.as_deref() {
            Some(name) => ours.with_name(name),
            None => ours,
        };
        other.add_bond(ours);
    }

    /// Add a one-sided bond record
    pub fn add_bond(&self, device: DeviceRecord) {
        let mut state = lock(&self.node.state);
        state.bonded.retain(|d| d.address != device.address);
        state.bonded.push(device.with_connected(false));
    }

    /// Devices reported while discovery runs
    pub fn set_nearby(&self, devices: Vec<DeviceRecord>) {
        lock(&self.node.state).nearby = devices;
    }

    /// Deliver an arbitrary event to subscribers
    pub fn inject(&self, event: TransportEvent) {
        self.node.links.emit(event);
    }

    /// Make the next `connect` fail
    pub fn fail_next_connect(&self, reason: &str) {
        lock(&self.node.state).fail_next_connect = Some(reason.to_string());
    }

    /// Make the next `accept` on this transport's listener fail
    ///
    /// A connection already waiting when the failure fires is dropped.
    pub fn fail_next_accept(&self, reason: &str) {
        lock(&self.node.state).fail_next_accept = Some(reason.to_string());
    }

    /// Make the next `remove_bond` fail
    pub fn fail_next_unbond(&self, reason: &str) {
        lock(&self.node.state).fail_next_unbond = Some(reason.to_string());
    }

    /// Whether discovery is running
    pub fn is_discovering(&self) -> bool {
        lock(&self.node.state).discovering
    }
}

#[async_trait]
impl TransportProvider for MemoryTransport {
    fn local_adapter(&self) -> LocalAdapter {
        self.node.adapter.clone()
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        let state = lock(&self.node.state);
        Ok(state
            .bonded
            .iter()
            .map(|d| {
                d.clone()
                    .with_connected(self.node.links.is_linked(&d.address))
            })
            .collect())
    }

    async fn remove_bond(&self, address: &str) -> Result<()> {
        let mut state = lock(&self.node.state);
        if let Some(reason) = state.fail_next_unbond.take() {
            return Err(ProtocolError::UnpairFailure(reason));
        }

        let before = state.bonded.len();
        state.bonded.retain(|d| d.address != address);
        if state.bonded.len() == before {
            return Err(ProtocolError::DeviceNotFound(address.to_string()));
        }
        info!("{}: bond with {} removed", self.address(), address);
        Ok(())
    }

    async fn is_connected(&self, address: &str) -> bool {
        self.node.links.is_linked(address)
    }

    async fn listen(&self, service_id: Uuid) -> Result<Box<dyn ConnectionListener>> {
        let key = (self.address().to_string(), service_id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.radio.register(key.clone(), tx.clone())?;
        debug!("{}: listening on {}", self.address(), service_id);

        Ok(Box::new(MemoryListener {
            radio: self.radio.clone(),
            node: self.node.clone(),
            key,
            tx,
            rx,
        }))
    }

    async fn connect(&self, address: &str, service_id: Uuid) -> Result<BoxedStream> {
        if let Some(reason) = lock(&self.node.state).fail_next_connect.take() {
            return Err(ProtocolError::Transport(reason));
        }

        let key = (address.to_string(), service_id);
        let (listener, remote_node) = match (self.radio.listener(&key), self.radio.node(address)) {
            (Some(listener), Some(node)) => (listener, node),
            _ => {
                return Err(ProtocolError::ConnectionRefused(format!(
                    "no listener for {} at {}",
                    service_id, address
                )))
            }
        };

        let (local_end, remote_end) = tokio::io::duplex(LINK_BUFFER_SIZE);
        let remote = self
            .node
            .record_for(address, remote_node.adapter.name.as_deref());
        let local = remote_node.record_for(self.address(), self.node.adapter.name.as_deref());

        let ours = self.node.links.track(local_end, remote);
        let theirs = remote_node.links.track(remote_end, local.clone());

        listener.send((theirs, local)).map_err(|_| {
            ProtocolError::ConnectionRefused(format!("{} stopped listening", address))
        })?;

        debug!("{}: connected to {}", self.address(), address);
        Ok(ours)
    }

    async fn start_discovery(&self) -> Result<()> {
        let nearby = {
            let mut state = lock(&self.node.state);
            state.discovering = true;
            state.nearby.clone()
        };
        for device in nearby {
            self.node.links.emit(TransportEvent::DeviceFound(device));
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        let was_discovering = std::mem::take(&mut lock(&self.node.state).discovering);
        if was_discovering {
            self.node.links.emit(TransportEvent::DiscoveryFinished);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.node.links.subscribe()
    }
}

struct MemoryListener {
    radio: MemoryRadio,
    node: Arc<Node>,
    key: ListenerKey,
    tx: mpsc::UnboundedSender<Incoming>,
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl ConnectionListener for MemoryListener {
    async fn accept(&mut self) -> Result<(BoxedStream, DeviceRecord)> {
        self.injected_failure()?;
        // `tx` is held by the listener itself, so `recv` only ends after `close`
        let incoming = self
            .rx
            .recv()
            .await
            .ok_or_else(|| ProtocolError::Transport("listener closed".to_string()))?;
        self.injected_failure()?;
        Ok(incoming)
    }

    async fn close(&mut self) -> Result<()> {
        self.radio.unregister(&self.key, &self.tx);
        self.rx.close();
        Ok(())
    }
}

impl MemoryListener {
    fn injected_failure(&self) -> Result<()> {
        match lock(&self.node.state).fail_next_accept.take() {
            Some(reason) => Err(ProtocolError::Transport(reason)),
            None => Ok(()),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.radio.unregister(&self.key, &self.tx);
    }
}
