//! Service Events
//!
//! Broadcast streams shared by the registry and the session manager:
//! inbound application messages, errors, and user-facing notices.
//! Slow subscribers lag and lose the oldest events; publishing never blocks.

use crate::{ProtocolError, ReceivedMessage};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Capacity of each broadcast stream
pub const EVENT_CAPACITY: usize = 256;

/// Broad class of a reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Accept, connect, read or write failure
    Transport,
    /// A frame or outbound message that breaks the wire format
    MalformedMessage,
    /// Bond-state event for a device that is not bonded
    UnpairedDevice,
    /// The transport refused to remove a bond
    UnpairFailure,
    /// Anything else
    Other,
}

/// An error as seen by observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Error class
    pub category: ErrorCategory,
    /// Full error text
    pub message: String,
    /// Short text suitable for a notification
    pub user_message: String,
    /// Whether retrying the operation can help
    pub recoverable: bool,
}

impl From<&ProtocolError> for ErrorEvent {
    fn from(error: &ProtocolError) -> Self {
        let category = match error {
            ProtocolError::Transport(_)
            | ProtocolError::Timeout(_)
            | ProtocolError::ConnectionRefused(_)
            | ProtocolError::Io(_) => ErrorCategory::Transport,
            ProtocolError::MalformedMessage(_) => ErrorCategory::MalformedMessage,
            ProtocolError::UnpairedDevice(_) => ErrorCategory::UnpairedDevice,
            ProtocolError::UnpairFailure(_) => ErrorCategory::UnpairFailure,
            _ => ErrorCategory::Other,
        };
        Self {
            category,
            message: error.to_string(),
            user_message: error.user_message(),
            recoverable: error.is_recoverable(),
        }
    }
}

/// Sender side of the service's broadcast streams
#[derive(Debug, Clone)]
pub struct EventBus {
    messages: broadcast::Sender<ReceivedMessage>,
    errors: broadcast::Sender<ErrorEvent>,
    notices: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create the streams with `EVENT_CAPACITY` each
    pub fn new() -> Self {
        Self {
            messages: broadcast::channel(EVENT_CAPACITY).0,
            errors: broadcast::channel(EVENT_CAPACITY).0,
            notices: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    /// Publish an inbound application message
    pub fn publish_message(&self, message: ReceivedMessage) {
        // no subscribers is not an error
        let _ = self.messages.send(message);
    }

    /// Log and publish an error
    ///
    /// Errors the user has to resolve are expected and logged at info level.
    pub fn report_error(&self, error: &ProtocolError) {
        if error.requires_user_action() {
            info!("{}", error);
        } else {
            warn!("{}", error);
        }
        let _ = self.errors.send(ErrorEvent::from(error));
    }

    /// Publish a user-facing notice
    pub fn notify(&self, notice: impl Into<String>) {
        let notice = notice.into();
        info!("Notice: {}", notice);
        let _ = self.notices.send(notice);
    }

    /// Subscribe to inbound application messages
    pub fn messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.messages.subscribe()
    }

    /// Subscribe to errors
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Subscribe to notices
    pub fn notices(&self) -> broadcast::Receiver<String> {
        self.notices.subscribe()
    }
}
