//! Configuration for the notebox server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio::process::Command;

/// Default HTTP/WebSocket port.
pub const DEFAULT_HTTP_PORT: u16 = 8081;

/// Command line used to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Re-run the current executable with the `worker` subcommand.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
        })
    }

    /// Parse a whitespace-separated command line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = PathBuf::from(parts.next()?);
        Some(Self {
            program,
            args: parts.map(str::to_string).collect(),
        })
    }

    /// Build a process command for this worker.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Configuration for the notebox server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP/WebSocket bind address.
    pub http_addr: SocketAddr,

    /// Worker command override. `None` re-runs this executable as a worker.
    pub worker_command: Option<WorkerCommand>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), DEFAULT_HTTP_PORT),
            worker_command: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NOTEBOX_HTTP_HOST` | `0.0.0.0` |
    /// | `NOTEBOX_HTTP_PORT` | `8081` |
    /// | `NOTEBOX_WORKER_CMD` | `<current exe> worker` |
    ///
    /// Workers inherit the environment, so the sandbox variables
    /// (`NOTEBOX_CELL_TIME_LIMIT_SECS` and friends) are read by each worker.
    pub fn from_env() -> Self {
        let http_host: IpAddr = std::env::var("NOTEBOX_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let http_port: u16 = std::env::var("NOTEBOX_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            worker_command: std::env::var("NOTEBOX_WORKER_CMD")
                .ok()
                .and_then(|v| WorkerCommand::parse(&v)),
        }
    }

    /// Resolve the worker command, falling back to the current executable.
    pub fn resolve_worker(&self) -> std::io::Result<WorkerCommand> {
        match &self.worker_command {
            Some(command) => Ok(command.clone()),
            None => WorkerCommand::current_exe(),
        }
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if let Some(command) = &self.worker_command {
            if command.program.is_absolute() && !command.program.exists() {
                tracing::warn!("Worker program not found: {:?}", command.program);
            }
        }
    }
}
