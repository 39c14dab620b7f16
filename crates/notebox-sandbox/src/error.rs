//! Error types for notebox-sandbox.

use notebox_rpc::RpcError;
use thiserror::Error;

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while hosting or running cells.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// `require` named a module outside the allow-list.
    #[error("forbidden module: {0}")]
    ForbiddenModule(String),

    /// The JavaScript engine failed outside of user code.
    #[error("engine error: {0}")]
    Engine(String),

    /// User code threw.
    #[error("{0}")]
    Exception(String),

    /// The cell exceeded its time limit or the host is shutting down.
    #[error("execution interrupted")]
    Interrupted,

    /// The sandbox thread is gone.
    #[error("sandbox is shut down")]
    ShutDown,

    /// RPC error
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rquickjs::Error> for SandboxError {
    fn from(e: rquickjs::Error) -> Self {
        Self::Engine(e.to_string())
    }
}
