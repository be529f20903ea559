//! PeerLink Service
//!
//! The handle other layers hold. It wires a transport provider and a device
//! store into a registry and a session manager, pumps transport events into
//! the registry, and exposes the control operations and observable streams.
//!
//! ## Lifecycle
//!
//! ```rust,no_run
//! use peerlink_protocol::{
//!     MemoryDeviceStore, MemoryRadio, MessageType, PeerLinkService, ServiceConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> peerlink_protocol::Result<()> {
//! let radio = MemoryRadio::new();
//! let service = PeerLinkService::new(
//!     ServiceConfig::default(),
//!     Arc::new(radio.transport("AA:BB:CC:DD:EE:01", Some("desk"))),
//!     Arc::new(MemoryDeviceStore::new()),
//! );
//!
//! service.start().await?;
//! service.start_serving().await?;
//! service.send(Some("hello"), MessageType::Standard).await?;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::events::{ErrorEvent, EventBus};
use crate::message::{Message, MessageType, ReceivedMessage};
use crate::registry::DeviceRegistry;
use crate::session::{LivenessSnapshot, Role, SessionManager, SessionState};
use crate::store::DeviceStore;
use crate::transport::{TransportEvent, TransportProvider};
use crate::{ClockSynchronizer, DeviceRecord, Result, ServiceConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Facade over registry, sessions and transport
pub struct PeerLinkService {
    config: ServiceConfig,
    transport: Arc<dyn TransportProvider>,
    registry: DeviceRegistry,
    sessions: SessionManager,
    clock: ClockSynchronizer,
    events: EventBus,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    discovery_timer: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLinkService {
    /// Assemble a service; nothing runs until `start`
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn TransportProvider>,
        store: Arc<dyn DeviceStore>,
    ) -> Self {
        let events = EventBus::new();
        let clock = ClockSynchronizer::new();
        let registry = DeviceRegistry::new(
            store,
            transport.clone(),
            events.clone(),
            config.paired_order,
        );
        let sessions = SessionManager::new(
            config.clone(),
            transport.clone(),
            registry.clone(),
            clock.clone(),
            events.clone(),
        );

        Self {
            config,
            transport,
            registry,
            sessions,
            clock,
            events,
            event_pump: Mutex::new(None),
            discovery_timer: Mutex::new(None),
        }
    }

    /// Subscribe to transport events and load the paired list
    ///
    /// # Errors
    ///
    /// `Configuration` if the settings are unusable; nothing is started.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        {
            let mut pump = lock(&self.event_pump);
            if pump.is_none() {
                let rx = self.transport.subscribe();
                *pump = Some(tokio::spawn(event_pump(
                    self.registry.clone(),
                    self.events.clone(),
                    rx,
                )));
            }
        }

        let paired = self.registry.reconcile().await.inspect_err(|e| {
            self.events.report_error(e);
        })?;
        info!("PeerLink service started with {} paired devices", paired.len());
        Ok(())
    }

    /// Begin accepting inbound connections
    pub async fn start_serving(&self) -> Result<()> {
        self.sessions.start_serving().await
    }

    /// Stop the accept loop and close the current session
    pub async fn stop_serving(&self) {
        self.sessions.stop_serving().await
    }

    /// Dial a bonded device
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.sessions.connect(address).await
    }

    /// Close the active session without stopping the accept loop
    pub async fn disconnect(&self) -> bool {
        self.sessions.disconnect().await
    }

    /// Send on the active session; `None` when there is none
    pub async fn send(
        &self,
        body: Option<&str>,
        message_type: MessageType,
    ) -> Result<Option<Message>> {
        self.sessions.send(body, message_type).await
    }

    /// Start a fresh scan; stops on its own after the discovery window
    pub async fn start_discovery(&self) -> Result<()> {
        self.registry.clear_scanned();
        self.transport
            .start_discovery()
            .await
            .inspect_err(|e| self.events.report_error(e))?;
        info!("Discovery started");

        let timer = self.config.discovery_window.map(|window| {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                sleep(window).await;
                debug!("Discovery window of {:?} elapsed", window);
                if let Err(e) = transport.stop_discovery().await {
                    warn!("Failed to stop discovery: {}", e);
                }
            })
        });
        if let Some(previous) = std::mem::replace(&mut *lock(&self.discovery_timer), timer) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop scanning
    pub async fn stop_discovery(&self) -> Result<()> {
        if let Some(timer) = lock(&self.discovery_timer).take() {
            timer.abort();
        }
        self.transport.stop_discovery().await?;
        info!("Discovery stopped");
        Ok(())
    }

    /// Remove a bond and its persisted record
    pub async fn unpair(&self, address: &str) -> Result<()> {
        self.registry.unpair(address).await
    }

    /// Change the persisted display name of a device
    pub async fn rename_device(&self, new_name: &str, address: &str) -> Result<()> {
        self.registry.rename(address, new_name).await
    }

    /// Reconcile the paired list with the transport now
    pub async fn refresh_paired(&self) -> Result<Vec<DeviceRecord>> {
        self.registry.reconcile().await
    }

    /// The stored record flagged connected, if any
    pub async fn currently_connected(&self) -> Result<Option<DeviceRecord>> {
        self.registry.currently_connected().await
    }

    /// Remote device and local role of the active session
    pub async fn active_session(&self) -> Option<(DeviceRecord, Role)> {
        self.sessions.active_session().await
    }

    /// Stop discovery, serving, the session and the event pump
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_discovery().await {
            debug!("Ignoring discovery stop error on shutdown: {}", e);
        }
        self.sessions.stop_serving().await;

        let pump = lock(&self.event_pump).take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        info!("PeerLink service shut down");
    }

    /// Observe the connected device
    pub fn connected_device(&self) -> watch::Receiver<Option<DeviceRecord>> {
        self.registry.connected_device()
    }

    /// Observe devices seen during discovery
    pub fn scanned_devices(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.registry.scanned()
    }

    /// Observe the paired-device list
    pub fn paired_devices(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.registry.paired()
    }

    /// Observe the session state machine
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.sessions.state()
    }

    /// Observe the liveness supervisor
    pub fn liveness(&self) -> watch::Receiver<LivenessSnapshot> {
        self.sessions.liveness()
    }

    /// Inbound application messages
    pub fn messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.events.messages()
    }

    /// Reported errors
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.events.errors()
    }

    /// User-facing notices
    pub fn notices(&self) -> broadcast::Receiver<String> {
        self.events.notices()
    }

    /// The logical clock
    pub fn clock(&self) -> &ClockSynchronizer {
        &self.clock
    }

    /// Whether the accept loop is running
    pub fn is_serving(&self) -> bool {
        self.sessions.is_serving()
    }
}

async fn event_pump(
    registry: DeviceRegistry,
    events: EventBus,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::DeviceFound(device) => {
                registry.on_device_found(device);
            }
            TransportEvent::BondStateChanged { device, connected } => {
                if let Err(e) = registry.on_bond_state_changed(device, connected).await {
                    events.report_error(&e);
                }
            }
            TransportEvent::DiscoveryFinished => {
                debug!("Discovery finished, reconciling");
                if let Err(e) = registry.reconcile().await {
                    events.report_error(&e);
                }
            }
        }
    }
    debug!("Transport event stream ended");
}
