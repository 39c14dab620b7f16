//! Wire message types shared by every transport.
//!
//! A message is a tagged record: `call` carries a method name and an ordered
//! argument list, `response` carries a single result value and `error`
//! carries a code and a description. The `id` links a `call` to its reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Error codes carried in `error` payloads.
///
/// The values follow the JSON-RPC 2.0 reserved range.
pub mod error_codes {
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - The handler failed.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Call correlation id, unique within one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Numeric id, as allocated by [`Rpc`](crate::Rpc).
    Number(u64),
    /// String id, accepted from peers that prefer opaque tokens.
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code (see [`error_codes`]).
    #[serde(default = "default_error_code")]
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

fn default_error_code() -> i32 {
    error_codes::INTERNAL_ERROR
}

/// Unit exchanged over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    /// Invoke `method` on the peer.
    Call {
        /// Correlation id assigned by the caller.
        id: MessageId,
        /// Method name to invoke.
        method: String,
        /// Ordered call arguments.
        #[serde(default)]
        payload: Vec<Value>,
    },
    /// Successful reply to a call.
    Response {
        /// Id of the originating call.
        id: MessageId,
        /// Result value.
        #[serde(default)]
        payload: Value,
    },
    /// Failed reply to a call.
    Error {
        /// Id of the originating call.
        id: MessageId,
        /// Error description.
        payload: ErrorPayload,
    },
}

impl Message {
    /// Create a `call` message.
    pub fn call(id: impl Into<MessageId>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            id: id.into(),
            method: method.into(),
            payload: args,
        }
    }

    /// Create a `response` message.
    pub fn response(id: impl Into<MessageId>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            payload: result,
        }
    }

    /// Create an `error` message.
    pub fn error(id: impl Into<MessageId>, code: i32, message: impl Into<String>) -> Self {
        Self::Error {
            id: id.into(),
            payload: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }

    /// The correlation id of this message.
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Call { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => id,
        }
    }

    /// The wire name of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the textual wire encoding.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the textual wire encoding.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let msg = Message::call(7, "runCell", vec![json!("1+1"), json!("cellA")]);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"kind": "call", "id": 7, "method": "runCell", "payload": ["1+1", "cellA"]})
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let msg = Message::error("abc", error_codes::METHOD_NOT_FOUND, "method not found: nope");
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "error");
        assert_eq!(value["id"], "abc");
        assert_eq!(value["payload"]["code"], -32601);
    }

    #[test]
    fn test_decode_accepts_string_and_numeric_ids() {
        let numeric = Message::decode(r#"{"kind":"response","id":3,"payload":2}"#).unwrap();
        assert_eq!(numeric.id(), &MessageId::Number(3));

        let text = Message::decode(r#"{"kind":"response","id":"x-1","payload":null}"#).unwrap();
        assert_eq!(text.id(), &MessageId::Text("x-1".into()));
    }

    #[test]
    fn test_decode_call_without_payload() {
        let msg = Message::decode(r#"{"kind":"call","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(msg, Message::call(1, "ping", vec![]));
    }

    #[test]
    fn test_decode_error_defaults_code() {
        let msg = Message::decode(r#"{"kind":"error","id":1,"payload":{"message":"boom"}}"#).unwrap();
        match msg {
            Message::Error { payload, .. } => {
                assert_eq!(payload.code, error_codes::INTERNAL_ERROR);
                assert_eq!(payload.message, "boom");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(Message::decode(r#"{"kind":"shout","id":1}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }
}
