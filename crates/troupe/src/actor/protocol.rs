//! # Client Protocol
//!
//! JSON messages exchanged between a client and an actor over a connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ActorError;
use crate::id::{ActorId, ConnId};

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToServer {
    /// Call an action; the response carries the same `id`
    ActionRequest {
        id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Subscribe to or unsubscribe from a broadcast event
    SubscriptionRequest { event_name: String, subscribe: bool },
}

/// Messages pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToClient {
    Init {
        actor_id: ActorId,
        conn_id: ConnId,
        conn_token: String,
    },
    ActionResponse {
        id: u64,
        output: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        /// Set when the error answers an action request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_id: Option<u64>,
    },
    Event {
        name: String,
        args: Vec<Value>,
    },
}

impl ToClient {
    /// Error message for an untrusted client. Internal errors are masked.
    pub fn error(err: &ActorError, action_id: Option<u64>) -> Self {
        let serialized = err.serialize(false);
        ToClient::Error {
            code: serialized.code,
            message: serialized.message,
            metadata: serialized.metadata,
            action_id,
        }
    }

    pub fn to_json(&self) -> Result<String, ActorError> {
        serde_json::to_string(self).map_err(ActorError::internal)
    }
}

/// Parse an inbound client message, enforcing the size limit before decoding.
pub fn parse_message(text: &str, max_size: usize) -> Result<ToServer, ActorError> {
    if text.len() > max_size {
        return Err(ActorError::MessageTooLong);
    }
    serde_json::from_str(text).map_err(|e| ActorError::MalformedMessage(e.to_string()))
}

/// Parse a binary frame as UTF-8 JSON.
pub fn parse_binary_message(data: &[u8], max_size: usize) -> Result<ToServer, ActorError> {
    if data.len() > max_size {
        return Err(ActorError::MessageTooLong);
    }
    let text = std::str::from_utf8(data).map_err(|e| ActorError::MalformedMessage(e.to_string()))?;
    parse_message(text, max_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_action_requests() {
        let msg = parse_message(
            r#"{"type":"action_request","id":7,"name":"increment","args":[1]}"#,
            1024,
        )
        .unwrap();
        assert_eq!(
            msg,
            ToServer::ActionRequest {
                id: 7,
                name: "increment".to_string(),
                args: vec![json!(1)],
            }
        );
    }

    #[test]
    fn rejects_oversized_messages() {
        let text = format!(
            r#"{{"type":"action_request","id":1,"name":"{}"}}"#,
            "x".repeat(100)
        );
        assert_eq!(parse_message(&text, 32), Err(ActorError::MessageTooLong));
    }

    #[test]
    fn rejects_malformed_messages() {
        let err = parse_message(r#"{"type":"launch_missiles"}"#, 1024).unwrap_err();
        assert_eq!(err.code(), "malformed_message");

        let err = parse_binary_message(&[0xff, 0xfe], 1024).unwrap_err();
        assert_eq!(err.code(), "malformed_message");
    }

    #[test]
    fn internal_errors_are_masked_on_the_wire() {
        let msg = ToClient::error(&ActorError::internal("secret"), Some(3));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "internal_error");
        assert_eq!(value["action_id"], 3);
        assert!(!value["message"].as_str().unwrap().contains("secret"));
    }
}
