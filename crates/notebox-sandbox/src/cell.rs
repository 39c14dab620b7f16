//! Cell identifiers and the output events a cell produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable identifier of a notebook cell, used to route its output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellId {
    Number(i64),
    Text(String),
}

impl CellId {
    /// The id as a JSON value, as it travels in event arguments.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for CellId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

impl From<i64> for CellId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

/// Kind of output a cell can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Print,
    Plot,
    DownloadProgress,
}

impl EventKind {
    /// Method name the event is delivered under.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Plot => "plot",
            Self::DownloadProgress => "downloadProgress",
        }
    }

    /// Parse a method name back into an event kind.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "print" => Some(Self::Print),
            "plot" => Some(Self::Plot),
            "downloadProgress" => Some(Self::DownloadProgress),
            _ => None,
        }
    }
}

/// One output event, tagged with the cell that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub kind: EventKind,
    pub cell: CellId,
    pub data: Value,
}

impl OutputEvent {
    pub fn new(kind: EventKind, cell: CellId, data: Value) -> Self {
        Self { kind, cell, data }
    }

    /// A `print` event carrying `text`.
    pub fn print(cell: CellId, text: impl Into<String>) -> Self {
        Self::new(EventKind::Print, cell, Value::String(text.into()))
    }
}
