//! Error types for notebox-server.

use notebox_rpc::{RpcError, TransportError};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while supervising a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to start the worker process
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] TransportError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// RPC error
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// The supervisor is shutting down and accepts no new connections
    #[error("server is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
