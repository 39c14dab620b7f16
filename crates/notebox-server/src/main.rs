//! notebox server entry point.
//!
//! ## Subcommands
//!
//! - **serve** (default): accept WebSocket clients, one worker per client
//! - **worker**: run one sandbox over stdin/stdout (spawned by `serve`)

use clap::{Parser, Subcommand};
use notebox_sandbox::SandboxOptions;
use notebox_server::{http, ServerConfig, Supervisor};
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// notebox server - isolated execution for notebook cells
#[derive(Parser, Debug)]
#[command(name = "notebox-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept WebSocket clients (default)
    Serve {
        /// Bind address, overrides NOTEBOX_HTTP_HOST/NOTEBOX_HTTP_PORT
        #[arg(short = 'a', long, value_name = "ADDR")]
        addr: Option<SocketAddr>,
    },
    /// Run one sandbox over stdin/stdout
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; a worker's stdout is its process channel
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("notebox_server=info".parse()?)
                .add_directive("notebox_sandbox=info".parse()?)
                .add_directive("notebox_rpc=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve { addr: None }) {
        Command::Serve { addr } => serve(addr).await,
        Command::Worker => worker().await,
    }
}

async fn worker() -> anyhow::Result<()> {
    let options = SandboxOptions::from_env();
    tracing::debug!(?options, "Starting worker");
    notebox_sandbox::run_worker(options).await?;
    Ok(())
}

async fn serve(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    tracing::info!("Starting notebox server");

    let mut config = ServerConfig::from_env();
    if let Some(addr) = addr {
        config.http_addr = addr;
    }
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();

    let supervisor = Supervisor::new(config.resolve_worker()?);

    // Create shutdown broadcast channel
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let http_supervisor = supervisor.clone();
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_supervisor, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    // Kill every worker before the listener stops
    supervisor.shutdown().await;
    let _ = shutdown_tx.send(());
    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
