//! Connection supervisor: one worker process per client.

use crate::config::WorkerCommand;
use crate::connection::{CloseReason, Connection, ConnectionId};
use crate::error::{Result, ServerError};
use chrono::{DateTime, Utc};
use notebox_rpc::{SocketTransport, Transport};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How long `shutdown()` waits for connections to tear down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Summary of a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub worker_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

struct Inner {
    worker: WorkerCommand,
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    drained: Notify,
    shutdown: CancellationToken,
}

/// Tracks live connections and owns their lifecycle.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor that starts workers with `worker`.
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker,
                connections: RwLock::new(HashMap::new()),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Serve `client` until the connection ends.
    ///
    /// Spawns a fresh worker for the client. Failures are contained to this
    /// connection.
    pub async fn serve_client(&self, client: SocketTransport) -> Result<CloseReason> {
        if self.inner.shutdown.is_cancelled() {
            client.close().await;
            return Err(ServerError::ShuttingDown);
        }

        let connection = match Connection::open(&self.inner.worker, client) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open connection");
                return Err(e);
            }
        };

        let id = connection.id();
        self.inner.connections.write().insert(
            id,
            ConnectionInfo {
                id,
                worker_pid: connection.worker_pid(),
                created_at: connection.created_at(),
            },
        );
        tracing::debug!(connection = %id, active = self.active_connections(), "Connection registered");

        let reason = connection.run(self.inner.shutdown.child_token()).await;

        let remaining = {
            let mut connections = self.inner.connections.write();
            connections.remove(&id);
            connections.len()
        };
        tracing::debug!(connection = %id, active = remaining, "Connection removed");
        if remaining == 0 {
            self.inner.drained.notify_waiters();
        }

        Ok(reason)
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Snapshot of live connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.read().values().cloned().collect()
    }

    /// True once `shutdown()` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close every connection and kill its worker.
    pub async fn shutdown(&self) {
        tracing::info!(active = self.active_connections(), "Shutting down supervisor");
        self.inner.shutdown.cancel();

        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.active_connections() == 0 {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
            tracing::warn!(
                active = self.active_connections(),
                "Connections still open after shutdown grace period"
            );
        }
    }
}
