//! PeerLink Protocol Implementation
//!
//! A point-to-point session engine between two bonded devices. One side
//! serves and becomes the master of the session; the other dials in and
//! follows the master's clock. Messages are `;`-delimited text records,
//! optionally length-prefixed, carried over any byte stream a transport
//! provider hands out.
//!
//! The pieces, bottom up:
//! - `clock`: the logical clock calibrated from the master
//! - `message`: the record codec
//! - `channel`: framed reads and writes over one stream
//! - `transport`: the provider trait, plus in-memory and TCP providers
//! - `store` and `registry`: the paired-device table and its snapshots
//! - `session`: the accept loop, dialing, and ping/pong liveness
//! - `service`: the facade tying it together

pub mod channel;
pub mod clock;
pub mod config;
pub mod device;
pub mod events;
pub mod message;
pub mod registry;
pub mod service;
pub mod session;
pub mod store;
pub mod transport;

mod error;
pub use channel::{FrameMode, TransferChannel};
pub use clock::{ClockState, ClockSynchronizer};
pub use config::{PING_INTERVAL, PONG_TIMEOUT, ServiceConfig};
pub use device::{DeviceRecord, PairedOrder};
pub use error::{ProtocolError, Result};
pub use events::{ErrorCategory, ErrorEvent, EventBus};
pub use message::{Message, MessageType, ReceivedMessage};
pub use registry::DeviceRegistry;
pub use service::PeerLinkService;
pub use session::{LivenessPhase, LivenessSnapshot, Role, SessionManager, SessionState};
pub use store::{DeviceStore, JsonDeviceStore, MemoryDeviceStore};
pub use transport::{
    BoxedStream, ConnectionListener, LocalAdapter, MemoryRadio, MemoryTransport, TcpPeer,
    TcpTransport, TransportEvent, TransportProvider, PEERLINK_SERVICE_UUID,
};
