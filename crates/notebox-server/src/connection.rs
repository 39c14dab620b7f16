//! One client connection bridged to one worker process.

use crate::config::WorkerCommand;
use crate::error::{Result, ServerError};
use chrono::{DateTime, Utc};
use notebox_rpc::{HandlerTable, Message, ProcessTransport, Rpc, SocketTransport, Transport};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed its socket.
    ClientDisconnected,
    /// The worker process exited or its channel failed.
    WorkerExited,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::WorkerExited => write!(f, "worker exited"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// A live client connection.
///
/// Owns the worker: the worker is killed when the connection ends, so a
/// connection never outlives its worker and vice versa.
pub struct Connection {
    id: ConnectionId,
    created_at: DateTime<Utc>,
    worker: Arc<ProcessTransport>,
    rpc: Rpc,
    relay: mpsc::UnboundedReceiver<Message>,
    client: SocketTransport,
}

impl Connection {
    /// Spawn a fresh worker for `client` and bind it to a relay-mode `Rpc`.
    pub fn open(worker: &WorkerCommand, client: SocketTransport) -> Result<Self> {
        let id = ConnectionId::new();
        let process = Arc::new(ProcessTransport::spawn(worker.command()).map_err(ServerError::Spawn)?);

        let rpc = Rpc::new(process.clone());
        let relay = rpc.start_relay(HandlerTable::new())?;

        tracing::info!(connection = %id, pid = ?process.pid(), "Connection opened");

        Ok(Self {
            id,
            created_at: Utc::now(),
            worker: process,
            rpc,
            relay,
            client,
        })
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// When the connection was opened.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// OS process id of the worker.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.pid()
    }

    /// Bridge client and worker until either side goes away or `shutdown`
    /// fires, then tear both down.
    pub async fn run(mut self, shutdown: CancellationToken) -> CloseReason {
        let reason = match self.client.incoming() {
            Some(from_client) => self.bridge(from_client, &shutdown).await,
            None => CloseReason::ClientDisconnected,
        };

        tracing::info!(connection = %self.id, %reason, "Connection closing");
        self.teardown(reason).await;
        reason
    }

    async fn bridge(
        &mut self,
        mut from_client: mpsc::UnboundedReceiver<Message>,
        shutdown: &CancellationToken,
    ) -> CloseReason {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return CloseReason::Shutdown,
                message = self.relay.recv() => match message {
                    Some(message) => {
                        if self.client.send(message).is_err() {
                            return CloseReason::ClientDisconnected;
                        }
                    }
                    None => return CloseReason::WorkerExited,
                },
                message = from_client.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.rpc.forward(message) {
                            tracing::warn!(connection = %self.id, error = %e, "Failed to forward to worker");
                            return CloseReason::WorkerExited;
                        }
                    }
                    None => return CloseReason::ClientDisconnected,
                },
            }
        }
    }

    async fn teardown(&self, reason: CloseReason) {
        if reason == CloseReason::WorkerExited {
            self.client.close().await;
        }

        self.rpc.stop().await;
        self.worker.kill().await;
        self.client.close().await;

        tracing::debug!(connection = %self.id, pid = ?self.worker.pid(), "Worker reaped");
    }
}
