//! Transfer Channel
//!
//! Wraps one link stream. A background read loop decodes frames into
//! `ReceivedMessage`s and hands them to a single consumer in arrival order;
//! writes go through `send`, serialized by an async mutex.
//!
//! ## Framing
//!
//! - `FrameMode::Legacy`: every read of up to 1024 bytes is one frame.
//!   Compatible with peers that write one record per call, but a record
//!   split or coalesced by the stream is misparsed.
//! - `FrameMode::LengthPrefixed`: each record is preceded by its length as
//!   a 4-byte big-endian integer.
//!
//! A frame that fails to decode is logged and skipped. The loop ends on end
//! of stream or a read error, which closes the inbound queue.

use crate::message::{size_label, Message, ReceivedMessage};
use crate::transport::BoxedStream;
use crate::{ClockSynchronizer, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Size of a single read in legacy framing
pub const READ_BUFFER_SIZE: usize = 1024;

/// Largest frame accepted in length-prefixed framing
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// How records are delimited on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// One read is one record
    Legacy,
    /// 4-byte big-endian length before each record
    #[default]
    LengthPrefixed,
}

/// An open link with a background read loop
pub struct TransferChannel {
    remote_address: String,
    framing: FrameMode,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransferChannel {
    /// Take ownership of a stream and start reading from it
    ///
    /// Returns the channel and the receiver of decoded inbound messages.
    /// Receive times come from `clock`.
    pub fn open(
        stream: BoxedStream,
        remote_address: impl Into<String>,
        framing: FrameMode,
        clock: ClockSynchronizer,
    ) -> (Self, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let remote_address = remote_address.into();
        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(read_loop(
            reader,
            framing,
            clock,
            inbound_tx,
            remote_address.clone(),
        ));

        debug!("Opened {:?} channel to {}", framing, remote_address);
        let channel = Self {
            remote_address,
            framing,
            writer: AsyncMutex::new(Some(writer)),
            read_task: Mutex::new(Some(read_task)),
        };
        (channel, inbound_rx)
    }

    /// Address of the remote end
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Write one record
    ///
    /// Returns false if the channel is closed or the write failed. Failures
    /// are logged, never raised.
    pub async fn send(&self, bytes: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            debug!("Send to {} on closed channel", self.remote_address);
            return false;
        };

        let frame = match self.framing {
            FrameMode::Legacy => bytes.to_vec(),
            FrameMode::LengthPrefixed => {
                if bytes.len() > MAX_FRAME_SIZE {
                    warn!(
                        "Frame to {} too large: {} bytes (max {})",
                        self.remote_address,
                        bytes.len(),
                        MAX_FRAME_SIZE
                    );
                    return false;
                }
                let mut frame = Vec::with_capacity(4 + bytes.len());
                frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                frame.extend_from_slice(bytes);
                frame
            }
        };

        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Write to {} failed: {}", self.remote_address, e);
                false
            }
        }
    }

    /// Encode and write a message
    ///
    /// # Errors
    ///
    /// `MalformedMessage` if the message cannot be encoded, `Transport` if
    /// the write did not go through.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        if self.send(&bytes).await {
            Ok(())
        } else {
            Err(ProtocolError::Transport(format!(
                "{} not delivered to {}",
                message.message_type, self.remote_address
            )))
        }
    }

    /// Stop the read loop and shut the stream down
    ///
    /// Safe to call more than once; errors while closing are ignored.
    pub async fn close(&self) {
        if let Some(task) = self.take_read_task() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Ignoring shutdown error for {}: {}", self.remote_address, e);
            }
        }
        debug!("Closed channel to {}", self.remote_address);
    }

    /// Whether both directions are still usable
    pub async fn is_open(&self) -> bool {
        let reading = self
            .read_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        reading && self.writer.lock().await.is_some()
    }

    fn take_read_task(&self) -> Option<JoinHandle<()>> {
        self.read_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for TransferChannel {
    fn drop(&mut self) {
        if let Some(task) = self.take_read_task() {
            task.abort();
        }
    }
}

async fn read_frame(
    reader: &mut ReadHalf<BoxedStream>,
    framing: FrameMode,
    buffer: &mut [u8],
) -> std::io::Result<Option<Vec<u8>>> {
    match framing {
        FrameMode::Legacy => {
            let n = reader.read(buffer).await?;
            Ok((n > 0).then(|| buffer[..n].to_vec()))
        }
        FrameMode::LengthPrefixed => {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }

            let len = u32::from_be_bytes(len_bytes) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
                ));
            }

            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame).await?;
            Ok(Some(frame))
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    framing: FrameMode,
    clock: ClockSynchronizer,
    inbound: mpsc::UnboundedSender<ReceivedMessage>,
    remote_address: String,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let frame = match read_frame(&mut reader, framing, &mut buffer).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Stream from {} closed", remote_address);
                break;
            }
            Err(e) => {
                warn!("Read from {} failed: {}", remote_address, e);
                break;
            }
        };

        let message = match Message::from_bytes(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping frame from {}: {}", remote_address, e);
                continue;
            }
        };

        debug!(
            "Received {} ({} bytes) from {}",
            message.message_type,
            frame.len(),
            remote_address
        );
        let received = ReceivedMessage {
            message,
            received_at: clock.now(),
            size_label: size_label(frame.len()),
            from_local_user: false,
        };
        if inbound.send(received).is_err() {
            debug!("Inbound consumer for {} gone", remote_address);
            break;
        }
    }
}
