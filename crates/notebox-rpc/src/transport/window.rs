//! Cross-context transport over a shared message bus.
//!
//! A [`Window`] models a browsing context's `postMessage` target: anyone who
//! holds a handle may post to it, so the receiving adapter must check every
//! envelope's channel id before trusting it.

use super::{Inbox, Transport};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Buffered envelopes per window before slow listeners start lagging.
const WINDOW_CAPACITY: usize = 1024;

/// A message posted to a window, tagged with the channel it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Channel id shared by the two legitimate endpoints.
    pub channel_id: String,
    /// The carried message.
    pub message: Message,
}

/// Message bus for one execution context.
#[derive(Clone)]
pub struct Window {
    bus: broadcast::Sender<Envelope>,
}

impl Window {
    /// Create a window with no listeners.
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(WINDOW_CAPACITY);
        Self { bus }
    }

    /// Post `envelope` to every listener. Returns false if nobody listens.
    pub fn post_message(&self, envelope: Envelope) -> bool {
        self.bus.send(envelope).is_ok()
    }

    /// Listen for envelopes posted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe()
    }

    /// Number of active listeners.
    pub fn listener_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport between two windows sharing a channel id.
pub struct WindowTransport {
    channel_id: String,
    target: Window,
    inbox: Inbox,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WindowTransport {
    /// Listen on `own` and post to `target`.
    ///
    /// Envelopes on `own` whose channel id differs from `channel_id` are
    /// dropped.
    pub fn new(own: &Window, target: Window, channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_envelopes(
            own.subscribe(),
            channel_id.clone(),
            inbound_tx,
        ));

        Self {
            channel_id,
            target,
            inbox: Inbox::new(inbound_rx),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }
    }

    /// The channel id this transport accepts.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

#[async_trait]
impl Transport for WindowTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let envelope = Envelope {
            channel_id: self.channel_id.clone(),
            message,
        };
        if self.target.post_message(envelope) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbox.take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn name(&self) -> &'static str {
        "window"
    }
}

impl Drop for WindowTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn read_envelopes(
    mut listener: broadcast::Receiver<Envelope>,
    channel_id: String,
    inbound: mpsc::UnboundedSender<Message>,
) {
    loop {
        match listener.recv().await {
            Ok(envelope) if envelope.channel_id == channel_id => {
                if inbound.send(envelope.message).is_err() {
                    break;
                }
            }
            Ok(envelope) => {
                tracing::warn!(
                    expected = %channel_id,
                    received = %envelope.channel_id,
                    "Dropping message with mismatched channel id"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Window listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_exchanges_messages() {
        let host = Window::new();
        let surface = Window::new();
        let outer = WindowTransport::new(&host, surface.clone(), "chan-1");
        let inner = WindowTransport::new(&surface, host.clone(), "chan-1");
        let mut inner_rx = inner.incoming().unwrap();
        let mut outer_rx = outer.incoming().unwrap();

        outer.send(Message::call(1, "runCell", vec![json!("1+1")])).unwrap();
        assert_eq!(
            inner_rx.recv().await.unwrap(),
            Message::call(1, "runCell", vec![json!("1+1")])
        );

        inner.send(Message::response(1, json!(null))).unwrap();
        assert_eq!(outer_rx.recv().await.unwrap(), Message::response(1, json!(null)));
    }

    #[tokio::test]
    async fn test_spoofed_channel_id_dropped() {
        let own = Window::new();
        let peer = Window::new();
        let transport = WindowTransport::new(&own, peer, "real");
        let mut incoming = transport.incoming().unwrap();

        own.post_message(Envelope {
            channel_id: "forged".into(),
            message: Message::call(1, "runCell", vec![json!("evil()")]),
        });
        own.post_message(Envelope {
            channel_id: "real".into(),
            message: Message::call(2, "ping", vec![]),
        });

        let first = incoming.recv().await.unwrap();
        assert_eq!(first, Message::call(2, "ping", vec![]));
        let none = tokio::time::timeout(Duration::from_millis(50), incoming.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_rejects_send() {
        let own = Window::new();
        let peer = Window::new();
        let _listener = peer.subscribe();
        let transport = WindowTransport::new(&own, peer, "c");
        let mut incoming = transport.incoming().unwrap();

        transport.close().await;
        assert!(incoming.recv().await.is_none());
        assert!(matches!(
            transport.send(Message::call(1, "ping", vec![])),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_without_listener_fails() {
        let own = Window::new();
        let transport = WindowTransport::new(&own, Window::new(), "c");
        assert!(transport.send(Message::call(1, "ping", vec![])).is_err());
    }
}
