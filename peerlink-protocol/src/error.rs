//! Error handling for the PeerLink protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! Stream I/O failures on accept, connect, read or write. They tear the
//! session down and are reported on the error stream; the caller decides
//! whether to reconnect.
//!
//! ### Message Errors
//! `MalformedMessage` is raised by the codec. Inside the read loop it is
//! logged and the frame is skipped.
//!
//! ### Registry Errors
//! `UnpairedDevice` and `UnpairFailure` are surfaced as user-facing notices
//! and never change persisted state.
//!
//! ## Usage
//!
//! ```rust
//! use peerlink_protocol::{Message, Result};
//!
//! fn parse(frame: &str) -> Result<Message> {
//!     let message = Message::decode(frame)?;
//!     Ok(message)
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use peerlink_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("AA:BB:CC:DD:EE:FF".to_string());
/// assert_eq!(error.to_string(), "Device not found: AA:BB:CC:DD:EE:FF");
///
/// let error = ProtocolError::NotConnected;
/// assert_eq!(error.to_string(), "Not connected");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, stream, etc.)
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream failure on accept, connect, read or write
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame that does not follow the wire format
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Bond-state event for a device that is not bonded
    #[error("Unpaired device: {0}")]
    UnpairedDevice(String),

    /// No pong arrived inside the pong window
    #[error("Liveness timeout: {0}")]
    LivenessTimeout(String),

    /// The transport refused to remove a bond
    #[error("Unpair failed: {0}")]
    UnpairFailure(String),

    /// Device not found in the registry or transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No active session
    #[error("Not connected")]
    NotConnected,

    /// Operation timed out
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Remote end refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific transport error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "no answer");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => ProtocolError::Transport(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and the operation can be re-initiated
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Timeout("dial".to_string()).is_recoverable());
    /// assert!(!ProtocolError::UnpairedDevice("AA".to_string()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::MalformedMessage(_)
                | ProtocolError::LivenessTimeout(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error needs the user to do something first
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnpairedDevice(_)
                | ProtocolError::UnpairFailure(_)
                | ProtocolError::Configuration(_)
        )
    }

    /// Get a short message suitable for a toast or notification
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::UnpairedDevice("AA:BB".to_string());
    /// assert_eq!(error.user_message(), "Can't connect to a non-paired device.");
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::UnpairedDevice(_) => "Can't connect to a non-paired device.".to_string(),
            ProtocolError::UnpairFailure(name) => {
                format!("Failed to unpair {}. Try again from system settings.", name)
            }
            ProtocolError::NotConnected => "No device connected.".to_string(),
            ProtocolError::DeviceNotFound(address) => {
                format!("Device '{}' not found. Check that it is paired.", address)
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check that the device is in range.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check that the other device is serving.".to_string()
            }
            ProtocolError::Transport(msg) => format!("Connection lost: {}.", msg),
            ProtocolError::LivenessTimeout(name) => format!("{} stopped responding.", name),
            ProtocolError::MalformedMessage(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
        }
    }
}
