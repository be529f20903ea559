//! Session Management
//!
//! At most one session is active at a time. The side that accepted the
//! connection is the `Master`: it sends the first `timeCalibration` and runs
//! the ping/pong liveness supervisor. The side that dialed out is the `Peer`:
//! it calibrates its clock from the master and answers pings.
//!
//! ```text
//! Idle ──start_serving──> Serving ──accept──> Connected{Master}
//!   │                                               │
//!   └──connect──> Connecting ──ok──> Connected{Peer} │
//!                      │                            │
//!                      └──fail──> Idle   Closing <──┘
//!
//! Closing: local close, stream error or liveness timeout
//! ```

mod liveness;
mod manager;

pub use manager::SessionManager;

use serde::{Deserialize, Serialize};

/// Role of the local side in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Accepted the connection
    Master,
    /// Dialed out
    Peer,
}

/// Session manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No listener, no session
    #[default]
    Idle,
    /// Accept loop running, no session
    Serving,
    /// Dial in progress
    Connecting,
    /// Session active
    Connected {
        /// Local role
        role: Role,
    },
    /// Session being torn down
    Closing,
}

impl SessionState {
    /// Whether a session is active
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }
}

/// Where the liveness supervisor is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LivenessPhase {
    /// No supervisor running
    #[default]
    Inactive,
    /// Waiting out the ping interval
    WaitingToPing,
    /// Ping sent, waiting for the pong
    WaitingForPong,
    /// No pong arrived in time; the supervisor stopped
    TimedOut,
}

/// Liveness counters for the current or last master session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LivenessSnapshot {
    /// Current phase
    pub phase: LivenessPhase,
    /// Pings sent in this session
    pub pings_sent: u64,
    /// Pongs received in answer to a ping
    pub pongs_received: u64,
    /// Whether the last ping was answered
    pub received_pong: bool,
}
