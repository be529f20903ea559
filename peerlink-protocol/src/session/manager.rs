//! Session Manager
//!
//! Owns the accept loop, the dial path and the single active session.
//! Each session runs two or three tasks:
//! - the channel's read loop
//! - a dispatch task routing inbound messages by type
//! - on the master side, the liveness supervisor
//!
//! Closing a session aborts its tasks, closes the channel and marks the
//! remote disconnected in the registry. The active session slot is guarded
//! by one async mutex, and every state transition happens under it.

use super::liveness::{self, PongSignal};
use super::{LivenessPhase, LivenessSnapshot, Role, SessionState};
use crate::channel::TransferChannel;
use crate::events::EventBus;
use crate::message::{Message, MessageType, ReceivedMessage};
use crate::registry::DeviceRegistry;
use crate::transport::{BoxedStream, ConnectionListener, TransportProvider};
use crate::{ClockSynchronizer, DeviceRecord, ProtocolError, Result, ServiceConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The live session
struct ActiveSession {
    id: u64,
    remote: DeviceRecord,
    role: Role,
    channel: Arc<TransferChannel>,
    dispatch: JoinHandle<()>,
    supervisor: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub(crate) config: ServiceConfig,
    pub(crate) registry: DeviceRegistry,
    sender_name: Option<String>,
    sender_address: Option<String>,
    transport: Arc<dyn TransportProvider>,
    clock: ClockSynchronizer,
    events: EventBus,
    active: Mutex<Option<ActiveSession>>,
    server: Mutex<Option<JoinHandle<()>>>,
    serving: AtomicBool,
    next_id: AtomicU64,
    state: watch::Sender<SessionState>,
    liveness: watch::Sender<LivenessSnapshot>,
}

impl Shared {
    /// Build an outbound message stamped with the logical clock
    pub(crate) fn outbound(&self, message_type: MessageType, body: Option<String>) -> Message {
        Message::new(
            message_type,
            self.sender_name.as_deref(),
            self.sender_address.as_deref(),
            self.clock.now(),
            body,
        )
    }

    pub(crate) fn publish_liveness(&self, snapshot: LivenessSnapshot) {
        self.liveness.send_replace(snapshot);
    }

    fn resting_state(&self) -> SessionState {
        if self.serving.load(Ordering::SeqCst) {
            SessionState::Serving
        } else {
            SessionState::Idle
        }
    }

    /// Install a session over a fresh stream, closing any previous one first
    async fn establish(self: &Arc<Self>, stream: BoxedStream, remote: DeviceRecord, role: Role) {
        let mut active = self.active.lock().await;
        // an accept that raced `stop_serving` must not install a session
        if role == Role::Master && !self.serving.load(Ordering::SeqCst) {
            debug!("Dropping connection from {}, no longer serving", remote.address);
            return;
        }
        if let Some(previous) = active.take() {
            self.state.send_replace(SessionState::Closing);
            info!(
                "Replacing session with {} by {}",
                previous.remote.address, remote.address
            );
            self.teardown(previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (channel, inbound) = TransferChannel::open(
            stream,
            remote.address.clone(),
            self.config.framing,
            self.clock.clone(),
        );
        let channel = Arc::new(channel);
        let pong = Arc::new(PongSignal::default());
        self.publish_liveness(LivenessSnapshot::default());

        // the remote was master exactly when we dialed out
        let remote = match self
            .registry
            .session_established(&remote, role == Role::Peer)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to record session with {}: {}", remote.address, e);
                remote.with_connected(true)
            }
        };

        let dispatch = tokio::spawn(dispatch_loop(
            self.clone(),
            id,
            role,
            channel.clone(),
            pong.clone(),
            inbound,
        ));

        let supervisor = match role {
            Role::Master => {
                let calibration = self.outbound(MessageType::TimeCalibration, None);
                if let Err(e) = channel.send_message(&calibration).await {
                    warn!("Initial calibration to {} failed: {}", remote.address, e);
                }
                Some(tokio::spawn(liveness::supervise(
                    self.clone(),
                    id,
                    remote.clone(),
                    channel.clone(),
                    pong,
                )))
            }
            Role::Peer => None,
        };

        info!(
            "Session {} with {} ({}) established as {:?}",
            id,
            remote.display_name(),
            remote.address,
            role
        );
        *active = Some(ActiveSession {
            id,
            remote,
            role,
            channel,
            dispatch,
            supervisor,
        });
        self.state.send_replace(SessionState::Connected { role });
    }

    /// Stop a session's tasks, close its stream and mark the remote disconnected
    async fn teardown(&self, session: ActiveSession) {
        session.dispatch.abort();
        let _ = session.dispatch.await;
        if let Some(supervisor) = session.supervisor {
            supervisor.abort();
            let _ = supervisor.await;
        }
        session.channel.close().await;

        if let Err(e) = self.registry.session_closed(&session.remote.address).await {
            warn!(
                "Failed to mark {} disconnected: {}",
                session.remote.address, e
            );
        }
        self.liveness.send_modify(|snapshot| {
            if snapshot.phase != LivenessPhase::TimedOut {
                snapshot.phase = LivenessPhase::Inactive;
            }
        });
        info!("Session {} with {} closed", session.id, session.remote.address);
    }

    /// Close the active session, or only session `only` when given
    ///
    /// Returns whether a session was closed.
    pub(crate) async fn close_session(&self, only: Option<u64>, reason: &str) -> bool {
        let mut active = self.active.lock().await;
        let session = match active.take() {
            Some(session) if only.map_or(true, |id| id == session.id) => session,
            other => {
                *active = other;
                return false;
            }
        };

        debug!("Closing session {}: {}", session.id, reason);
        self.state.send_replace(SessionState::Closing);
        self.teardown(session).await;
        self.state.send_replace(self.resting_state());
        true
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    session_id: u64,
    role: Role,
    channel: Arc<TransferChannel>,
    pong: Arc<PongSignal>,
    mut inbound: mpsc::UnboundedReceiver<ReceivedMessage>,
) {
    while let Some(received) = inbound.recv().await {
        match received.message.message_type {
            MessageType::Standard => shared.events.publish_message(received),
            MessageType::TimeCalibration => match role {
                Role::Peer => shared.clock.set_master_time(received.message.sent_at),
                Role::Master => debug!("Ignoring calibration from {}", channel.remote_address()),
            },
            MessageType::Ping => {
                let reply = shared.outbound(MessageType::Pong, None);
                if let Err(e) = channel.send_message(&reply).await {
                    warn!("Pong to {} failed: {}", channel.remote_address(), e);
                }
            }
            MessageType::Pong => pong.mark_received(),
        }
    }

    // the read loop ended on its own: remote closed or the stream failed
    let address = channel.remote_address().to_string();
    drop(channel);
    tokio::spawn(async move {
        if shared
            .close_session(Some(session_id), "stream ended")
            .await
        {
            shared.events.report_error(&ProtocolError::Transport(format!(
                "connection to {} closed",
                address
            )));
        }
    });
}

async fn accept_loop(shared: Arc<Shared>, mut listener: Box<dyn ConnectionListener>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                info!("Accepted connection from {}", remote.address);
                let shared = shared.clone();
                tokio::spawn(async move {
                    shared.establish(stream, remote, Role::Master).await;
                });
            }
            Err(e) => {
                error!("Accept failed, no longer serving: {}", e);
                shared.events.report_error(&e);
                break;
            }
        }
    }

    if let Err(e) = listener.close().await {
        debug!("Ignoring listener close error: {}", e);
    }
    shared.serving.store(false, Ordering::SeqCst);
    shared.state.send_if_modified(|state| {
        if *state == SessionState::Serving {
            *state = SessionState::Idle;
            true
        } else {
            false
        }
    });
}

/// Accept loop, dial path and the single active session
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create an idle manager
    ///
    /// Outbound messages carry `config.local_name`/`local_address`, falling
    /// back to the transport's adapter identity.
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn TransportProvider>,
        registry: DeviceRegistry,
        clock: ClockSynchronizer,
        events: EventBus,
    ) -> Self {
        let adapter = transport.local_adapter();
        let sender_name = config.local_name.clone().or(adapter.name);
        let sender_address = config.local_address.clone().or(adapter.address);

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                sender_name,
                sender_address,
                transport,
                clock,
                events,
                active: Mutex::new(None),
                server: Mutex::new(None),
                serving: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                state: watch::channel(SessionState::Idle).0,
                liveness: watch::channel(LivenessSnapshot::default()).0,
            }),
        }
    }

    /// Open the listening endpoint and start accepting
    ///
    /// Does nothing if the accept loop is already running. After an accept
    /// failure the loop stays stopped until this is called again.
    pub async fn start_serving(&self) -> Result<()> {
        let shared = &self.shared;
        let mut server = shared.server.lock().await;
        if server.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Already serving");
            return Ok(());
        }

        let listener = match shared.transport.listen(shared.config.service_id).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start serving: {}", e);
                shared.events.report_error(&e);
                return Err(e);
            }
        };

        shared.serving.store(true, Ordering::SeqCst);
        shared.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Serving;
                true
            } else {
                false
            }
        });
        *server = Some(tokio::spawn(accept_loop(shared.clone(), listener)));
        info!("Serving on {}", shared.config.service_id);
        Ok(())
    }

    /// Stop accepting and close the active session
    pub async fn stop_serving(&self) {
        let task = self.shared.server.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!("Stopped serving");
        }
        self.shared.serving.store(false, Ordering::SeqCst);
        self.shared.close_session(None, "server stopped").await;
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Serving {
                *state = SessionState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Dial a device and establish a session as `Peer`
    ///
    /// Any active session is closed first. A failed dial is reported on the
    /// error stream as well as returned, and leaves the manager idle (or
    /// serving, if the accept loop runs).
    pub async fn connect(&self, address: &str) -> Result<()> {
        let shared = &self.shared;
        let remote = shared
            .registry
            .lookup(address)
            .unwrap_or_else(|| DeviceRecord::new(address));

        {
            let mut active = shared.active.lock().await;
            if let Some(previous) = active.take() {
                shared.state.send_replace(SessionState::Closing);
                shared.teardown(previous).await;
            }
            shared.state.send_replace(SessionState::Connecting);
        }

        info!("Connecting to {} ({})", remote.display_name(), address);
        let dial = timeout(
            shared.config.connect_timeout,
            shared.transport.connect(address, shared.config.service_id),
        )
        .await
        .unwrap_or_else(|_| Err(ProtocolError::Timeout(format!("connecting to {}", address))));

        match dial {
            Ok(stream) => {
                shared.establish(stream, remote, Role::Peer).await;
                Ok(())
            }
            Err(e) => {
                error!("Connect to {} failed: {}", address, e);
                let resting = shared.resting_state();
                shared.state.send_if_modified(|state| {
                    if *state == SessionState::Connecting {
                        *state = resting;
                        true
                    } else {
                        false
                    }
                });
                shared.events.report_error(&e);
                Err(e)
            }
        }
    }

    /// Close the active session; the accept loop keeps running
    pub async fn disconnect(&self) -> bool {
        self.shared.close_session(None, "disconnect requested").await
    }

    /// Send a message on the active session
    ///
    /// Returns the sent message, or `None` when no session is active.
    ///
    /// # Errors
    ///
    /// `MalformedMessage` if the body contains the field delimiter,
    /// `Transport` if the write failed.
    pub async fn send(
        &self,
        body: Option<&str>,
        message_type: MessageType,
    ) -> Result<Option<Message>> {
        let channel = match self.shared.active.lock().await.as_ref() {
            Some(session) => session.channel.clone(),
            None => {
                debug!("No active session, dropping {} message", message_type);
                return Ok(None);
            }
        };

        let message = self
            .shared
            .outbound(message_type, body.map(str::to_string));
        channel.send_message(&message).await?;
        debug!("Sent {} to {}", message_type, channel.remote_address());
        Ok(Some(message))
    }

    /// Whether the accept loop is running
    pub fn is_serving(&self) -> bool {
        self.shared.serving.load(Ordering::SeqCst)
    }

    /// Remote device and local role of the active session
    pub async fn active_session(&self) -> Option<(DeviceRecord, Role)> {
        self.shared
            .active
            .lock()
            .await
            .as_ref()
            .map(|session| (session.remote.clone(), session.role))
    }

    /// Observe the state machine
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Observe the liveness supervisor
    pub fn liveness(&self) -> watch::Receiver<LivenessSnapshot> {
        self.shared.liveness.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDeviceStore;
    use crate::transport::{MemoryRadio, MemoryTransport, PEERLINK_SERVICE_UUID};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Node {
        transport: MemoryTransport,
        sessions: SessionManager,
        registry: DeviceRegistry,
        events: EventBus,
        clock: ClockSynchronizer,
    }

    fn node(radio: &MemoryRadio, address: &str, name: &str) -> Node {
        let transport = radio.transport(address, Some(name));
        let events = EventBus::new();
        let clock = ClockSynchronizer::new();
        let transport_handle: Arc<dyn TransportProvider> = Arc::new(transport.clone());
        let registry = DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            transport_handle.clone(),
            events.clone(),
            Default::default(),
        );
        let sessions = SessionManager::new(
            ServiceConfig {
                framing: crate::FrameMode::LengthPrefixed,
                ..ServiceConfig::default()
            },
            transport_handle,
            registry.clone(),
            clock.clone(),
            events.clone(),
        );
        Node {
            transport,
            sessions,
            registry,
            events,
            clock,
        }
    }

    async fn wait_for_state(node: &Node, expected: SessionState) {
        let mut state = node.sessions.state();
        timeout(Duration::from_secs(5), state.wait_for(|s| *s == expected))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn frame(message: &Message) -> Vec<u8> {
        let record = message.to_bytes().unwrap();
        let mut frame = (record.len() as u32).to_be_bytes().to_vec();
        frame.extend(record);
        frame
    }

    async fn read_message(stream: &mut BoxedStream) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut record = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut record).await.unwrap();
        Message::from_bytes(&record).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let b = node(&radio, "BB", "beta");
        a.transport.bond_with(&b.transport);

        a.sessions.start_serving().await.unwrap();
        assert_eq!(*a.sessions.state().borrow(), SessionState::Serving);

        b.sessions.connect("AA").await.unwrap();
        assert_eq!(
            *b.sessions.state().borrow(),
            SessionState::Connected { role: Role::Peer }
        );
        wait_for_state(&a, SessionState::Connected { role: Role::Master }).await;

        let mut inbound = b.events.messages();
        let sent = a
            .sessions
            .send(Some("hello"), MessageType::Standard)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.sender_address, "AA");

        let received = timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message.body.as_deref(), Some("hello"));
        assert_eq!(received.message.sender_address, "AA");
        assert!(b.clock.is_calibrated());
        assert!(!a.clock.is_calibrated());
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let sent = a.sessions.send(Some("hi"), MessageType::Standard).await.unwrap();
        assert!(sent.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let radio = MemoryRadio::new();
        let b = node(&radio, "BB", "beta");
        let mut errors = b.events.errors();

        let result = b.sessions.connect("AA").await;
        assert!(matches!(result, Err(ProtocolError::ConnectionRefused(_))));
        assert_eq!(*b.sessions.state().borrow(), SessionState::Idle);

        let error = errors.recv().await.unwrap();
        assert_eq!(error.category, crate::ErrorCategory::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_pings_and_peer_answers() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let b = node(&radio, "BB", "beta");
        a.transport.bond_with(&b.transport);

        a.sessions.start_serving().await.unwrap();
        b.sessions.connect("AA").await.unwrap();
        wait_for_state(&a, SessionState::Connected { role: Role::Master }).await;

        let mut liveness = a.sessions.liveness();
        timeout(
            Duration::from_secs(45),
            liveness.wait_for(|s| s.pongs_received == 1),
        )
        .await
        .unwrap()
        .unwrap();

        let snapshot = *liveness.borrow();
        assert_eq!(snapshot.pings_sent, 1);
        assert!(snapshot.received_pong);
        assert!(a.sessions.active_session().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timeout_marks_disconnected() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let silent = radio.transport("SS", Some("silent"));
        a.transport.bond_with(&silent);
        a.registry.reconcile().await.unwrap();
        let mut errors = a.events.errors();

        a.sessions.start_serving().await.unwrap();
        // a raw stream that never answers
        let mut stream = silent.connect("AA", PEERLINK_SERVICE_UUID).await.unwrap();
        wait_for_state(&a, SessionState::Connected { role: Role::Master }).await;

        let calibration = read_message(&mut stream).await;
        assert_eq!(calibration.message_type, MessageType::TimeCalibration);
        let ping = read_message(&mut stream).await;
        assert_eq!(ping.message_type, MessageType::Ping);

        wait_for_state(&a, SessionState::Serving).await;
        let snapshot = *a.sessions.liveness().borrow();
        assert_eq!(snapshot.phase, LivenessPhase::TimedOut);
        assert_eq!(snapshot.pings_sent, 1);

        let paired = a.registry.paired().borrow().clone();
        assert!(paired.iter().all(|d| !d.is_connected));

        // no further pings after the timeout
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(a.sessions.liveness().borrow().pings_sent, 1);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // a silent peer is a disconnect, not an error
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_answers_raw_ping() {
        let radio = MemoryRadio::new();
        let b = node(&radio, "BB", "beta");
        let raw = radio.transport("RR", Some("raw"));
        let mut listener = raw.listen(PEERLINK_SERVICE_UUID).await.unwrap();

        b.sessions.connect("RR").await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let ping = Message::new(
            MessageType::Ping,
            Some("raw"),
            Some("RR"),
            chrono::Utc::now(),
            None,
        );
        stream.write_all(&frame(&ping)).await.unwrap();

        let reply = read_message(&mut stream).await;
        assert_eq!(reply.message_type, MessageType::Pong);
        assert_eq!(reply.sender_address, "BB");
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_session() {
        let radio = MemoryRadio::new();
        let b = node(&radio, "BB", "beta");
        let raw = radio.transport("RR", Some("raw"));
        let mut listener = raw.listen(PEERLINK_SERVICE_UUID).await.unwrap();
        let mut errors = b.events.errors();

        b.sessions.connect("RR").await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        wait_for_state(&b, SessionState::Idle).await;
        assert!(b.sessions.active_session().await.is_none());
        let error = timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.category, crate::ErrorCategory::Transport);
    }

    #[tokio::test]
    async fn test_accept_failure_stops_serving() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let mut errors = a.events.errors();
        a.transport.fail_next_accept("adapter reset");

        a.sessions.start_serving().await.unwrap();
        let error = timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.category, crate::ErrorCategory::Transport);

        wait_for_state(&a, SessionState::Idle).await;
        assert!(!a.sessions.is_serving());

        // serving stays off until restarted explicitly
        let b = node(&radio, "BB", "beta");
        a.transport.bond_with(&b.transport);
        assert!(b.sessions.connect("AA").await.is_err());

        a.sessions.start_serving().await.unwrap();
        assert!(a.sessions.is_serving());
        assert_eq!(*a.sessions.state().borrow(), SessionState::Serving);
        b.sessions.connect("AA").await.unwrap();
        wait_for_state(&a, SessionState::Connected { role: Role::Master }).await;
    }

    #[tokio::test]
    async fn test_late_accept_after_stop_is_dropped() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let (local, mut remote) = tokio::io::duplex(1024);

        a.sessions
            .shared
            .establish(Box::new(local), DeviceRecord::new("BB"), Role::Master)
            .await;

        assert!(a.sessions.active_session().await.is_none());
        assert_eq!(*a.sessions.state().borrow(), SessionState::Idle);
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_serving() {
        let radio = MemoryRadio::new();
        let a = node(&radio, "AA", "alpha");
        let b = node(&radio, "BB", "beta");
        a.transport.bond_with(&b.transport);

        a.sessions.start_serving().await.unwrap();
        b.sessions.connect("AA").await.unwrap();
        wait_for_state(&a, SessionState::Connected { role: Role::Master }).await;

        assert!(a.sessions.disconnect().await);
        assert!(!a.sessions.disconnect().await);
        assert_eq!(*a.sessions.state().borrow(), SessionState::Serving);
        assert!(a.sessions.is_serving());

        wait_for_state(&b, SessionState::Idle).await;

        a.sessions.stop_serving().await;
        assert_eq!(*a.sessions.state().borrow(), SessionState::Idle);
        assert!(!a.sessions.is_serving());
        // the endpoint is free again
        a.sessions.start_serving().await.unwrap();
    }
}
