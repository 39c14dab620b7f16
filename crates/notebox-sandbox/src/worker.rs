//! Worker process entry point.

use crate::config::SandboxOptions;
use crate::error::Result;
use crate::host::SandboxHost;
use notebox_rpc::{ProcessTransport, Rpc};
use std::sync::Arc;

/// Serve one sandbox over this process's stdin/stdout until the parent
/// closes the channel.
///
/// stdout carries the process channel, so nothing else may write to it.
pub async fn run_worker(options: SandboxOptions) -> Result<()> {
    let transport = Arc::new(ProcessTransport::from_stdio());
    let rpc = Rpc::new(transport);

    let host = SandboxHost::spawn(options, rpc.clone()).await?;
    rpc.start(host.handlers())?;

    tracing::info!(pid = std::process::id(), "Worker ready");

    rpc.closed().await;

    tracing::info!("Process channel closed, shutting down worker");
    host.shutdown().await;
    rpc.stop().await;
    Ok(())
}
