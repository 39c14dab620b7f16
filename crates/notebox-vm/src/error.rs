//! Error types for notebox-vm.

use notebox_rpc::RpcError;
use notebox_sandbox::SandboxError;
use thiserror::Error;

/// Result type alias for VM operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while driving a VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// `destroy()` was called
    #[error("vm destroyed")]
    Destroyed,

    /// The sandboxed surface could not be set up
    #[error("surface error: {0}")]
    Surface(String),

    /// Error from the RPC layer, including remote cell failures
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Error from the in-process sandbox
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}
