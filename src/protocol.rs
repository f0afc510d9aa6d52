//! Wire protocol shared by [`WsTransport`](crate::transport::WsTransport) and
//! the server in [`server::api`](crate::server::api).
//!
//! All messages are JSON-encoded with a `"type"` discriminant tag.
//!
//! ## Client → Server ([`ClientMessage`])
//!
//! - `call`: request/response operation, answered by `result` or `error`
//! - `subscribe`: open a live query; `id` doubles as the subscription id
//! - `unsubscribe`: release a subscription opened on this connection
//! - `ping`: keepalive
//!
//! ## Server → Client ([`ServerMessage`])
//!
//! - `result` / `error`: reply correlated by request `id`
//! - `change`: notification for a subscription
//! - `pong`: keepalive reply

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// A message sent from the client to the bridge server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke a request/response operation.
    ///
    /// `method` stays a plain string so the server can reject names outside
    /// the operation set with `UNKNOWN_OPERATION`.
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Open a live query.
    Subscribe { id: u64, query: Value },

    /// Close the subscription opened by request `subscription`.
    Unsubscribe { id: u64, subscription: u64 },

    /// Keepalive ping.
    Ping,
}

/// A message sent from the bridge server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful reply to `call`, `subscribe` or `unsubscribe`.
    Result {
        id: u64,
        #[serde(default)]
        value: Value,
    },

    /// Failed reply.
    Error {
        id: u64,
        code: ErrorCode,
        message: String,
    },

    /// Change notification for an open subscription.
    Change {
        subscription: u64,
        #[serde(default)]
        old: Value,
        #[serde(default)]
        new: Value,
    },

    /// Response to a client `ping` message.
    Pong,
}

impl ServerMessage {
    /// Build the error reply for request `id`.
    pub fn error(id: u64, err: &BridgeError) -> Self {
        ServerMessage::Error {
            id,
            code: err.code(),
            message: err.detail(),
        }
    }
}

/// Machine-readable error codes sent in [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingCapability,
    UnknownOperation,
    InvalidQuery,
    UpstreamSubscribeFailure,
    Storage,
    Transport,
    Disconnected,
    Timeout,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_uses_type_tag() {
        let msg = ClientMessage::Call {
            id: 7,
            method: "count".into(),
            args: vec![json!({"table": "users"})],
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "call", "id": 7, "method": "count", "args": [{"table": "users"}]})
        );
    }

    #[test]
    fn change_defaults_missing_values_to_null() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"change","subscription":3,"new":[1]}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Change {
                subscription: 3,
                old: Value::Null,
                new: json!([1]),
            }
        );
    }

    #[test]
    fn error_reply_carries_code() {
        let err = BridgeError::InvalidQuery("query payload is absent".into());
        let reply = ServerMessage::error(4, &err);
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains(r#""code":"INVALID_QUERY""#));
        assert!(text.contains("query payload is absent"));
    }
}
