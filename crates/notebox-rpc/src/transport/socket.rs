//! WebSocket transport.

use super::{Inbox, Outbox, Transport};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

/// A WebSocket frame, reduced to what the transport cares about.
///
/// Both the dialing client (`tokio-tungstenite`) and an accepting server map
/// their native frame types onto this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame carrying one encoded message.
    Text(String),
    /// Binary frame; not part of the protocol.
    Binary(Vec<u8>),
    /// Ping/pong and other control frames.
    Control,
    /// Close frame from the peer.
    Close,
}

impl From<WsMessage> for Frame {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => Self::Text(text),
            WsMessage::Binary(data) => Self::Binary(data),
            WsMessage::Close(_) => Self::Close,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Self::Control,
        }
    }
}

/// Transport over a persistent WebSocket connection.
///
/// Each message is one JSON text frame.
pub struct SocketTransport {
    inbox: Inbox,
    outbox: Outbox,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Dial `url` and wrap the resulting connection.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        tracing::debug!(url, ?timeout, "Connecting WebSocket");

        let (socket, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| TransportError::ConnectTimeout(timeout))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = socket.split();
        let stream = stream.map(|frame| frame.map(Frame::from));
        let sink = sink.with(|text: String| {
            future::ready(Ok::<_, tungstenite::Error>(WsMessage::Text(text)))
        });

        tracing::info!(url, "WebSocket connected");
        Ok(Self::from_frames(stream, sink))
    }

    /// Wrap an already-established socket given as a frame stream and a
    /// text sink.
    ///
    /// Closing the sink is expected to send a close frame to the peer.
    pub fn from_frames<S, E, K>(stream: S, sink: K) -> Self
    where
        S: Stream<Item = Result<Frame, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
        K: Sink<String> + Send + 'static,
        K::Error: fmt::Display + Send,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_frames(stream, inbound_tx));
        let writer = tokio::spawn(write_frames(sink, outbound_rx));

        Self {
            inbox: Inbox::new(inbound_rx),
            outbox: Outbox::new(outbound_tx, writer),
            reader: Mutex::new(Some(reader)),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbox.send(message)
    }

    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbox.take()
    }

    async fn close(&self) {
        self.outbox.shutdown(self.name()).await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn read_frames<S, E>(stream: S, inbound: mpsc::UnboundedSender<Message>)
where
    S: Stream<Item = Result<Frame, E>>,
    E: fmt::Display,
{
    let mut stream = Box::pin(stream);

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Frame::Text(text)) => text,
            Ok(Frame::Binary(data)) => {
                tracing::warn!(len = data.len(), "Dropping binary frame");
                continue;
            }
            Ok(Frame::Control) => continue,
            Ok(Frame::Close) => {
                tracing::debug!("Peer sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read failed");
                break;
            }
        };

        match Message::decode(&text) {
            Ok(message) => {
                tracing::trace!(kind = message.kind(), id = %message.id(), "Received message");
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "Dropping malformed message");
            }
        }
    }
}

async fn write_frames<K>(sink: K, mut outbound: mpsc::UnboundedReceiver<Message>)
where
    K: Sink<String>,
    K::Error: fmt::Display,
{
    let mut sink = Box::pin(sink);

    while let Some(message) = outbound.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode message");
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            tracing::warn!(error = %e, "WebSocket write failed");
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "WebSocket close failed");
    }
}
