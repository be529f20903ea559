//! PeerLink Transport Layer
//!
//! Transport providers behind one trait:
//! - `MemoryTransport`: in-process radio over `tokio::io::duplex`, for tests
//!   and local wiring
//! - `TcpTransport`: peers reached over TCP from a static peer table

pub mod memory;
pub mod tcp;
mod r#trait;

pub use memory::{MemoryRadio, MemoryTransport};
pub use r#trait::{
    BoxedStream, ConnectionListener, LinkStream, LocalAdapter, TransportEvent, TransportProvider,
    PEERLINK_SERVICE_UUID,
};
pub use tcp::{TcpPeer, TcpTransport};

use crate::DeviceRecord;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Stream wrapper that runs a callback once the stream is dropped
///
/// Providers use it to notice that a link went down without polling.
pub struct TrackedStream<S> {
    inner: S,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> TrackedStream<S> {
    /// Wrap a stream
    pub fn new(inner: S, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_close: Some(Box::new(on_close)),
        }
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Open links per remote address, plus fan-out of transport events
///
/// A link counts as up while at least one tracked stream to the address is
/// alive. The first stream raises `BondStateChanged { connected: true }`,
/// dropping the last one raises the matching `false`.
#[derive(Debug, Default)]
pub(crate) struct LinkTracker {
    links: Mutex<HashMap<String, usize>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl LinkTracker {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn is_linked(&self, address: &str) -> bool {
        lock(&self.links).contains_key(address)
    }

    /// Wrap a stream so the link to `remote` stays up for its lifetime
    pub(crate) fn track<S>(self: &Arc<Self>, stream: S, remote: DeviceRecord) -> BoxedStream
    where
        S: LinkStream + 'static,
    {
        self.link_up(&remote);
        let weak = Arc::downgrade(self);
        Box::new(TrackedStream::new(stream, move || {
            if let Some(tracker) = weak.upgrade() {
                tracker.link_down(&remote);
            }
        }))
    }

    fn link_up(&self, remote: &DeviceRecord) {
        let first = {
            let mut links = lock(&self.links);
            let count = links.entry(remote.address.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            debug!("Link to {} up", remote.address);
            self.emit(TransportEvent::BondStateChanged {
                device: remote.clone().with_connected(true),
                connected: true,
            });
        }
    }

    fn link_down(&self, remote: &DeviceRecord) {
        let last = {
            let mut links = lock(&self.links);
            match links.get_mut(&remote.address) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    links.remove(&remote.address);
                    true
                }
                None => false,
            }
        };
        if last {
            debug!("Link to {} down", remote.address);
            self.emit(TransportEvent::BondStateChanged {
                device: remote.clone().with_connected(false),
                connected: false,
            });
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
