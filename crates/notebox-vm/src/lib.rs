//! # notebox-vm
//!
//! Client-side handle to a notebook sandbox.
//!
//! A [`Vm`] tries the configured notebox server first and falls back to an
//! in-process [`SandboxSurface`] when the server cannot be reached. Cell
//! output comes back as calls routed by cell id to caller-registered
//! [`OutputSink`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                          Vm                          │
//! │   init(): socket within connect_timeout, else surface │
//! └──────────────┬───────────────────────┬───────────────┘
//!                │ SocketTransport       │ WindowTransport
//!                ▼                       ▼
//!        notebox-server           SandboxSurface
//!        (worker process)         (in-process host)
//!                │                       │
//!                └──── print / plot / downloadProgress ───▶ OutputRegistry
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use notebox_vm::{rpc_handlers, OutputRegistry, Vm, VmConfig};
//! use std::sync::Arc;
//!
//! let registry = OutputRegistry::new();
//! let _sub = registry.register("cellA", Arc::new(MySink));
//!
//! let vm = Vm::new(VmConfig::from_env(), rpc_handlers(registry.clone()));
//! vm.exec("1 + 1", "cellA").await?;
//! vm.destroy().await;
//! ```

mod config;
mod error;
pub mod output;
pub mod surface;
mod vm;

pub use config::{VmConfig, DEFAULT_CONNECT_TIMEOUT};
pub use error::{Result, VmError};
pub use output::{rpc_handlers, CellLookup, OutputRegistry, OutputSink, Subscription};
pub use surface::SandboxSurface;
pub use vm::{TransportKind, Vm};

// Re-export commonly used types from dependencies
pub use notebox_rpc::Window;
pub use notebox_sandbox::{CellId, EventKind};
