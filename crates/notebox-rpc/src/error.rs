//! Error types for notebox-rpc.

use crate::message::error_codes;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced to the caller of an RPC operation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// `stop()` was called while the call was outstanding, or before it was issued.
    #[error("connection stopped")]
    Stopped,

    /// The transport closed before a response arrived.
    #[error("transport closed before a response arrived")]
    TransportClosed,

    /// `start()` was already called on this instance.
    #[error("rpc already started")]
    AlreadyStarted,

    /// No response within the configured call timeout.
    #[error("call {method} timed out after {timeout:?}")]
    Timeout {
        /// Method that was called
        method: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// The peer answered with an `error` message.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Error code from the peer
        code: i32,
        /// Error message from the peer
        message: String,
    },

    /// The underlying transport rejected the message.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The adapter is closed and accepts no more messages.
    #[error("transport closed")]
    Closed,

    /// Failed to establish the underlying channel.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The underlying channel was not established in time.
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a handler; converted into an `error` message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The call arguments did not match what the handler expects.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The operation itself failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Create a failure from any displayable error.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Wire error code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::Failed(_) => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidParams(e.to_string())
    }
}
