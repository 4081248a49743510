//! Outbound message queue with backpressure.
//!
//! Messages are checked by the protocol guard, serialized, and handed to a
//! writer task through an unbounded channel. The number of bytes queued but
//! not yet written is tracked so producers can pause above a threshold.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::message::ClientMessage;
use super::protocol::ProtocolGuard;

/// Poll interval while waiting for the queue to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Cloneable handle for sending messages to the agent.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<(Message, usize)>,
    buffered: Arc<AtomicUsize>,
    guard: Arc<Mutex<ProtocolGuard>>,
}

impl Outbound {
    /// Creates a handle and the receiving half for [`spawn_writer`].
    #[must_use]
    pub fn new(guard: Arc<Mutex<ProtocolGuard>>) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let queue = OutboundQueue {
            rx,
            buffered: Arc::clone(&buffered),
        };
        (Self { tx, buffered, guard }, queue)
    }

    /// Bytes queued but not yet written to the socket.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Queues a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the message is out of order, or
    /// [`Error::WebSocket`] if the writer has stopped.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .before_send(message)?;
        let text = message.to_json()?;
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send((Message::Text(text.into()), len)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(Error::WebSocket("agent connection is closed".into()));
        }
        log::trace!("Queued {} ({len} bytes)", message.kind());
        Ok(())
    }

    /// Waits until at most `threshold` bytes are queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires while waiting.
    pub async fn wait_for_drain(&self, threshold: usize, cancel: &CancellationToken) -> Result<()> {
        while self.buffered_bytes() > threshold {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
        Ok(())
    }
}

/// Receiving half of an [`Outbound`] handle.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<(Message, usize)>,
    buffered: Arc<AtomicUsize>,
}

/// Spawns the task that writes queued messages to `sink`. The task ends,
/// closing the sink, once every [`Outbound`] handle is dropped.
pub fn spawn_writer<S>(mut sink: S, mut queue: OutboundQueue) -> JoinHandle<Result<()>>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some((message, len)) = queue.rx.recv().await {
            let sent = sink.send(message).await;
            queue.buffered.fetch_sub(len, Ordering::AcqRel);
            sent?;
        }
        // The peer may already be gone; nothing left to deliver either way.
        let _ = sink.close().await;
        Ok::<(), Error>(())
    })
}
