//! Message Codec
//!
//! Messages travel as UTF-8 text records of five `;`-separated fields:
//!
//! ```text
//! <type>;<senderName>;<senderAddress>;<ISO-8601 sentAt>;<body>
//! ```
//!
//! The delimiter count is fixed, the body may be empty. Field content is not
//! escaped, so encoding refuses any field containing `;` rather than produce
//! a record that would decode into different fields.
//!
//! On decode the type tag is matched case-insensitively; an unknown tag
//! decodes as `pong`, which existing peers rely on.

use crate::device::{UNIDENTIFIED_ADDRESS, UNIDENTIFIED_NAME};
use crate::{ProtocolError, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field separator on the wire
pub const FIELD_DELIMITER: char = ';';

/// Number of fields in a record
pub const FIELD_COUNT: usize = 5;

/// Kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Application payload
    Standard,
    /// Master clock reference for the peer
    TimeCalibration,
    /// Liveness probe from the master
    Ping,
    /// Liveness answer from the peer
    Pong,
}

impl MessageType {
    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Standard => "standardMessage",
            MessageType::TimeCalibration => "timeCalibration",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }

    /// Parse a wire tag, falling back to `Pong` for anything unknown
    pub fn from_tag(tag: &str) -> Self {
        [
            MessageType::TimeCalibration,
            MessageType::Standard,
            MessageType::Ping,
            MessageType::Pong,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(tag))
        .unwrap_or(MessageType::Pong)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of communication over a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Kind of message
    pub message_type: MessageType,
    /// Name of the sending device
    pub sender_name: String,
    /// Address of the sending device
    pub sender_address: String,
    /// Sender's logical time when the message was sent
    pub sent_at: DateTime<Utc>,
    /// Payload; an empty body is carried as `None`
    pub body: Option<String>,
}

impl Message {
    /// Build a message, substituting placeholders for a missing sender identity
    ///
    /// `sent_at` is truncated to the millisecond precision of the wire format.
    pub fn new(
        message_type: MessageType,
        sender_name: Option<&str>,
        sender_address: Option<&str>,
        sent_at: DateTime<Utc>,
        body: Option<String>,
    ) -> Self {
        Self {
            message_type,
            sender_name: sender_name.unwrap_or(UNIDENTIFIED_NAME).to_string(),
            sender_address: sender_address.unwrap_or(UNIDENTIFIED_ADDRESS).to_string(),
            sent_at: sent_at.trunc_subsecs(3),
            body: body.filter(|b| !b.is_empty()),
        }
    }

    /// Encode to the wire record
    ///
    /// Fails with `MalformedMessage` if a field contains the delimiter.
    pub fn encode(&self) -> Result<String> {
        let body = self.body.as_deref().unwrap_or("");
        for (field, value) in [
            ("sender name", self.sender_name.as_str()),
            ("sender address", self.sender_address.as_str()),
            ("body", body),
        ] {
            if value.contains(FIELD_DELIMITER) {
                return Err(ProtocolError::MalformedMessage(format!(
                    "{} must not contain '{}'",
                    field, FIELD_DELIMITER
                )));
            }
        }

        Ok(format!(
            "{};{};{};{};{}",
            self.message_type,
            self.sender_name,
            self.sender_address,
            self.sent_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            body
        ))
    }

    /// Encode to UTF-8 bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.encode().map(String::into_bytes)
    }

    /// Decode a wire record
    ///
    /// Splits into at most five fields; anything past the fourth delimiter
    /// belongs to the body.
    pub fn decode(frame: &str) -> Result<Self> {
        let fields: Vec<&str> = frame.splitn(FIELD_COUNT, FIELD_DELIMITER).collect();
        if fields.len() < FIELD_COUNT {
            return Err(ProtocolError::MalformedMessage(format!(
                "expected {} fields, got {}",
                FIELD_COUNT,
                fields.len()
            )));
        }

        let sent_at = DateTime::parse_from_rfc3339(fields[3].trim())
            .map_err(|e| {
                ProtocolError::MalformedMessage(format!(
                    "invalid timestamp '{}': {}",
                    fields[3], e
                ))
            })?
            .with_timezone(&Utc);

        let body = fields[4];
        Ok(Self {
            message_type: MessageType::from_tag(fields[0]),
            sender_name: fields[1].to_string(),
            sender_address: fields[2].to_string(),
            sent_at,
            body: if body.is_empty() {
                None
            } else {
                Some(body.to_string())
            },
        })
    }

    /// Decode UTF-8 bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ProtocolError::MalformedMessage(format!("invalid UTF-8: {}", e)))?;
        Self::decode(text)
    }
}

/// A decoded inbound message with local receive metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// The decoded message
    pub message: Message,
    /// Local logical time the frame was read
    pub received_at: DateTime<Utc>,
    /// Human-readable frame size, e.g. `"0.05KB"`
    pub size_label: String,
    /// Always false for messages read from the stream
    pub from_local_user: bool,
}

/// Format a byte count the way the message list shows it
///
/// Sizes below one megabyte are shown in kilobytes.
pub fn size_label(bytes: usize) -> String {
    let kb = bytes as f64 / 1024.0;
    let mb = kb / 1024.0;
    if mb >= 1.0 {
        format!("{:.2}MB", mb)
    } else {
        format!("{:.2}KB", kb)
    }
}
