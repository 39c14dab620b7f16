//! Transport adapters.
//!
//! Every adapter wraps one duplex channel behind [`Transport`]:
//!
//! - [`ProcessTransport`]: newline-delimited JSON over a child process's
//!   stdin/stdout (or the worker's own stdio).
//! - [`SocketTransport`]: JSON text frames over a WebSocket.
//! - [`WindowTransport`]: envelopes on a shared [`Window`] message bus,
//!   filtered by channel id.
//!
//! Serialization, origin validation and process-exit observation stay inside
//! the adapters. The RPC core only sees [`Message`] values and the end of the
//! inbound stream, which is the terminal condition for every transport.

mod process;
mod socket;
mod window;

pub use process::ProcessTransport;
pub use socket::{Frame, SocketTransport};
pub use window::{Envelope, Window, WindowTransport};

use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `close()` waits for queued messages to drain.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Uniform wrapper around a duplex message channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue `message` for delivery to the peer.
    ///
    /// Never blocks; messages are delivered in the order they were queued.
    fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Take the inbound message stream.
    ///
    /// Returns `None` if the stream was already taken. The stream ends when
    /// the channel closes.
    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Message>>;

    /// Release the channel. Safe to call more than once.
    async fn close(&self);

    /// Short adapter name for logs.
    fn name(&self) -> &'static str;
}

/// Take-once holder for an adapter's inbound stream.
pub(crate) struct Inbox(Mutex<Option<mpsc::UnboundedReceiver<Message>>>);

impl Inbox {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self(Mutex::new(Some(rx)))
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.0.lock().take()
    }
}

/// Outbound queue drained by an adapter's writer task.
pub(crate) struct Outbox {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>, writer: JoinHandle<()>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub(crate) fn send(&self, message: Message) -> Result<(), TransportError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// Stop accepting messages and wait for the writer to flush.
    pub(crate) async fn shutdown(&self, transport: &'static str) {
        drop(self.tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                tracing::warn!(transport, "Writer did not drain in time, aborting");
                writer.abort();
            }
        }
    }
}
