//! Ping/pong supervision on the master side

use super::manager::Shared;
use super::{LivenessPhase, LivenessSnapshot};
use crate::channel::TransferChannel;
use crate::message::MessageType;
use crate::{DeviceRecord, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// The `receivedPong` flag, with a wakeup for the waiting supervisor
#[derive(Debug, Default)]
pub(crate) struct PongSignal {
    received: AtomicBool,
    notify: Notify,
}

impl PongSignal {
    pub(crate) fn mark_received(&self) {
        self.received.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub(crate) fn reset(&self) {
        self.received.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_received() {
                return;
            }
            // a stale permit from an unsolicited pong just loops back here
            notified.await;
        }
    }
}

pub(crate) async fn supervise(
    shared: Arc<Shared>,
    session_id: u64,
    remote: DeviceRecord,
    channel: Arc<TransferChannel>,
    pong: Arc<PongSignal>,
) {
    let mut snapshot = LivenessSnapshot {
        phase: LivenessPhase::WaitingToPing,
        ..LivenessSnapshot::default()
    };
    shared.publish_liveness(snapshot);

    loop {
        sleep(shared.config.ping_interval).await;

        pong.reset();
        let ping = shared.outbound(MessageType::Ping, None);
        if let Err(e) = channel.send_message(&ping).await {
            warn!("Ping to {} failed: {}", remote.address, e);
        }
        snapshot.pings_sent += 1;
        snapshot.received_pong = false;
        snapshot.phase = LivenessPhase::WaitingForPong;
        shared.publish_liveness(snapshot);
        debug!("Ping #{} sent to {}", snapshot.pings_sent, remote.address);

        if timeout(shared.config.pong_timeout, pong.wait()).await.is_ok() {
            snapshot.pongs_received += 1;
            snapshot.received_pong = true;
            snapshot.phase = LivenessPhase::WaitingToPing;
            shared.publish_liveness(snapshot);
            debug!("Pong from {}", remote.address);
            continue;
        }

        let error = ProtocolError::LivenessTimeout(remote.display_name().to_string());
        warn!(
            "{} (no pong within {:?}), marking {} disconnected",
            error, shared.config.pong_timeout, remote.address
        );
        snapshot.phase = LivenessPhase::TimedOut;
        shared.publish_liveness(snapshot);

        if let Err(e) = shared.registry.set_connected(&remote.address, false).await {
            warn!("Failed to mark {} disconnected: {}", remote.address, e);
        }

        // closing aborts this task, so it has to run elsewhere
        let shared = shared.clone();
        let reason = error.to_string();
        tokio::spawn(async move {
            shared.close_session(Some(session_id), &reason).await;
        });
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_once_marked() {
        let signal = Arc::new(PongSignal::default());
        let marker = signal.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            marker.mark_received();
        });

        timeout(Duration::from_secs(5), signal.wait()).await.unwrap();
        assert!(signal.is_received());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_pong_does_not_satisfy_next_wait() {
        let signal = PongSignal::default();
        signal.mark_received();
        signal.reset();

        assert!(timeout(Duration::from_secs(10), signal.wait()).await.is_err());
        assert!(!signal.is_received());
    }
}
