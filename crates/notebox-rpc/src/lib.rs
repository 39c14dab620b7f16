//! # notebox-rpc
//!
//! Transport-agnostic call/response RPC for notebox sandboxes.
//!
//! One [`Rpc`] instance binds to one [`Transport`] and gives both directions
//! of a conversation the same shape: the local side issues named calls and
//! awaits their replies, the remote side services them from a
//! [`HandlerTable`].
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐            ┌────────────────────────────┐
//! │            Rpc             │            │            Rpc             │
//! │  - call() / begin_call()   │            │  HandlerTable              │
//! │  - pending calls by id     │            │   "runCell" -> handler     │
//! │  - stop()                  │            │   "ping"    -> handler     │
//! └─────────────┬──────────────┘            └─────────────▲──────────────┘
//!               │ Message                                 │ Message
//!               ▼                                         │
//! ┌────────────────────────────┐   wire     ┌─────────────┴──────────────┐
//! │   Transport adapter        │ ─────────▶ │   Transport adapter        │
//! │   process / socket / window│ ◀───────── │   process / socket / window│
//! └────────────────────────────┘            └────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use notebox_rpc::{HandlerTable, ProcessTransport, Rpc};
//! use std::sync::Arc;
//!
//! # async fn example() -> notebox_rpc::Result<()> {
//! let worker = ProcessTransport::spawn(tokio::process::Command::new("notebox-server"))?;
//! let rpc = Rpc::new(Arc::new(worker));
//! rpc.start(HandlerTable::new())?;
//!
//! let result = rpc.call("runCell", vec!["1+1".into(), "cellA".into()]).await?;
//! println!("{result}");
//!
//! rpc.stop().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod handler;
mod message;
mod rpc;
pub mod transport;

pub use error::{HandlerError, Result, RpcError, TransportError};
pub use handler::{arg, Handler, HandlerFuture, HandlerTable};
pub use message::{error_codes, ErrorPayload, Message, MessageId};
pub use rpc::{PendingResponse, Rpc, RpcConfig, RpcState};
pub use transport::{
    Envelope, Frame, ProcessTransport, SocketTransport, Transport, Window, WindowTransport,
};
