//! Handler table: the named operations an endpoint services for its peer.

use crate::error::HandlerError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// A registered operation: ordered call arguments in, result value out.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Mapping from method name to handler.
///
/// Built once and handed to [`Rpc::start`](crate::Rpc::start); the table is
/// not modified afterwards.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `method`, replacing any previous entry.
    pub fn register<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.insert(method.into(), handler);
        self
    }

    /// Look up the handler for `method`.
    pub fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).cloned()
    }

    /// Check whether `method` is registered.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Deserialize the positional argument at `index`.
///
/// A missing argument is read as `null`, so `Option<T>` parameters may be
/// omitted by the caller.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| HandlerError::InvalidParams(format!("argument {index}: {e}")))
}
