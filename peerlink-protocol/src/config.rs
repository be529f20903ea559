//! Service Configuration

use crate::channel::FrameMode;
use crate::device::PairedOrder;
use crate::transport::PEERLINK_SERVICE_UUID;
use crate::{ProtocolError, Result};
use std::time::Duration;
use uuid::Uuid;

/// Interval between liveness pings
pub const PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// How long the master waits for a pong
pub const PONG_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Upper bound on a single dial
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Discovery stops on its own after this long
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(30);

/// Tunables for a `PeerLinkService`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Sender name on outbound messages; the adapter name when unset
    pub local_name: Option<String>,
    /// Sender address on outbound messages; the adapter address when unset
    pub local_address: Option<String>,
    /// Service identifier to listen and dial on
    pub service_id: Uuid,
    /// Interval between pings on the master side
    pub ping_interval: Duration,
    /// Pong wait after each ping
    pub pong_timeout: Duration,
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Record framing on the stream
    pub framing: FrameMode,
    /// Ordering of the published paired list
    pub paired_order: PairedOrder,
    /// Auto-stop delay for discovery; `None` scans until stopped
    pub discovery_window: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            local_name: None,
            local_address: None,
            service_id: PEERLINK_SERVICE_UUID,
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            framing: FrameMode::default(),
            paired_order: PairedOrder::default(),
            discovery_window: Some(DISCOVERY_WINDOW),
        }
    }
}

impl ServiceConfig {
    /// Reject settings the session layer cannot run with
    ///
    /// # Errors
    ///
    /// `Configuration` if a timer is zero, or if the pong wait is not
    /// shorter than the ping interval.
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("ping_interval", Some(self.ping_interval)),
            ("pong_timeout", Some(self.pong_timeout)),
            ("connect_timeout", Some(self.connect_timeout)),
            ("discovery_window", self.discovery_window),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, d)| *d == Some(Duration::ZERO)) {
            return Err(ProtocolError::Configuration(format!("{} must not be zero", name)));
        }
        if self.pong_timeout >= self.ping_interval {
            return Err(ProtocolError::Configuration(format!(
                "pong_timeout ({:?}) must be shorter than ping_interval ({:?})",
                self.pong_timeout, self.ping_interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(10));
        assert_eq!(config.framing, FrameMode::LengthPrefixed);
        assert_eq!(config.paired_order, PairedOrder::DisconnectedFirst);
        assert_eq!(config.discovery_window, Some(Duration::from_secs(30)));
        assert!(config.local_name.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_timers() {
        let zero_window = ServiceConfig {
            discovery_window: Some(Duration::ZERO),
            ..ServiceConfig::default()
        };
        let err = zero_window.validate().unwrap_err();
        assert!(matches!(err, ProtocolError::Configuration(_)));
        assert!(err.requires_user_action());

        let slow_pong = ServiceConfig {
            pong_timeout: Duration::from_secs(30),
            ..ServiceConfig::default()
        };
        assert!(slow_pong.validate().is_err());

        let no_window = ServiceConfig {
            discovery_window: None,
            ..ServiceConfig::default()
        };
        assert!(no_window.validate().is_ok());
    }
}
