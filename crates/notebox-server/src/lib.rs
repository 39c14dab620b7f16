//! # notebox-server
//!
//! Connection supervisor for notebox sandboxes.
//!
//! Every WebSocket client gets its own worker process running a
//! [`notebox_sandbox::SandboxHost`]. The server relays messages between the
//! two without interpreting them and kills the worker when the client goes
//! away.
//!
//! ```text
//!   client ──ws──▶ Connection ──stdin/stdout──▶ worker (notebox-server worker)
//!          ◀─────            ◀───────────────
//! ```

pub mod config;
pub mod connection;
mod error;
pub mod http;
pub mod supervisor;

pub use config::{ServerConfig, WorkerCommand};
pub use connection::{CloseReason, Connection, ConnectionId};
pub use error::{Result, ServerError};
pub use supervisor::{ConnectionInfo, Supervisor};
