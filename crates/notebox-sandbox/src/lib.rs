//! # notebox-sandbox
//!
//! Restricted JavaScript execution for notebook cells.
//!
//! A [`SandboxHost`] owns one [`SandboxContext`] on a dedicated thread and
//! services `runCell` calls from its peer. Everything a cell prints, plots
//! or downloads is sent back as an outbound call tagged with the cell id,
//! queued before the cell's own reply.
//!
//! Cells can reach the outside world only through `require` of the
//! allow-listed modules in [`ALLOWED_MODULES`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use notebox_sandbox::{SandboxContext, SandboxOptions};
//!
//! let context = SandboxContext::new(SandboxOptions::default(), |event| {
//!     println!("{:?}: {}", event.cell, event.data);
//! })?;
//! context.run_cell(&"cellA".into(), "1 + 1")?; // prints "2"
//! ```

mod cell;
mod config;
mod context;
mod error;
mod host;
mod modules;
mod worker;

pub use cell::{CellId, EventKind, OutputEvent};
pub use config::{SandboxOptions, DEFAULT_MAX_DOWNLOAD_BYTES};
pub use context::{InterruptHandle, SandboxContext};
pub use error::{Result, SandboxError};
pub use host::SandboxHost;
pub use modules::{check_module, ALLOWED_MODULES};
pub use worker::run_worker;
