//! # Node Protocol
//!
//! Messages exchanged between nodes over the coordinate driver's channels.
//! Messages whose name starts with `Leader` travel from a follower to the
//! node leading the actor and are acknowledged by it; `Follower` messages
//! flow back to the node that terminates the client's transport.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use troupe::actor::RawFrame;
use troupe::{
    ActorError, ActorId, ConnDriverKind, ConnId, NodeId, RequestInfo, SerializedError, ToClient,
    ToServer,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    pub sender_node_id: NodeId,
    pub message_id: String,
    pub body: NodeMessageBody,
}

impl NodeMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ActorError> {
        serde_json::to_vec(self).map_err(|e| ActorError::internal(format!("encode node message: {}", e)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ActorError> {
        serde_json::from_slice(payload).map_err(|e| ActorError::MalformedMessage(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessageBody {
    /// Receipt of the message with `message_id`
    Ack {
        message_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    /// One-shot action call. The result comes back as an `ActionResponse`
    LeaderAction {
        request_id: String,
        actor_id: ActorId,
        action_name: String,
        args: Vec<Value>,
        params: Value,
        request: RequestInfo,
    },
    ActionResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    LeaderConnOpen {
        actor_id: ActorId,
        conn_id: ConnId,
        conn_token: String,
        driver_kind: ConnDriverKind,
        params: Value,
        request: RequestInfo,
        /// Reattach to a persisted conn instead of creating one
        reconnect: bool,
        /// Names the follower transport this open is for
        transport_id: String,
    },
    LeaderConnMessage {
        actor_id: ActorId,
        conn_id: ConnId,
        conn_token: String,
        message: ToServer,
    },
    LeaderConnClose {
        actor_id: ActorId,
        conn_id: ConnId,
        /// Every follower transport the conn had
        transport_ids: Vec<String>,
    },
    FollowerConnMessage {
        transport_id: String,
        message: ToClient,
    },
    FollowerConnClose {
        transport_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    LeaderWebSocketOpen {
        actor_id: ActorId,
        websocket_id: String,
        url: String,
        headers: HashMap<String, String>,
    },
    LeaderWebSocketMessage {
        actor_id: ActorId,
        websocket_id: String,
        frame: WireFrame,
    },
    LeaderWebSocketClose {
        actor_id: ActorId,
        websocket_id: String,
        code: u16,
        reason: String,
    },
    FollowerWebSocketMessage {
        websocket_id: String,
        frame: WireFrame,
    },
    FollowerWebSocketClose {
        websocket_id: String,
        code: u16,
        reason: String,
    },
    /// The driver fired an alarm on a node that does not lead the actor
    LeaderAlarm {
        actor_id: ActorId,
    },
}

impl NodeMessageBody {
    /// Whether the receiver acknowledges this message.
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            Self::LeaderAction { .. }
                | Self::LeaderConnOpen { .. }
                | Self::LeaderConnMessage { .. }
                | Self::LeaderConnClose { .. }
                | Self::LeaderWebSocketOpen { .. }
                | Self::LeaderAlarm { .. }
                | Self::FollowerConnClose { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::LeaderAction { .. } => "leader_action",
            Self::ActionResponse { .. } => "action_response",
            Self::LeaderConnOpen { .. } => "leader_conn_open",
            Self::LeaderConnMessage { .. } => "leader_conn_message",
            Self::LeaderConnClose { .. } => "leader_conn_close",
            Self::FollowerConnMessage { .. } => "follower_conn_message",
            Self::FollowerConnClose { .. } => "follower_conn_close",
            Self::LeaderWebSocketOpen { .. } => "leader_websocket_open",
            Self::LeaderWebSocketMessage { .. } => "leader_websocket_message",
            Self::LeaderWebSocketClose { .. } => "leader_websocket_close",
            Self::FollowerWebSocketMessage { .. } => "follower_websocket_message",
            Self::FollowerWebSocketClose { .. } => "follower_websocket_close",
            Self::LeaderAlarm { .. } => "leader_alarm",
        }
    }
}

/// Raw WebSocket frame on the wire. Binary payloads are base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WireFrame {
    Text(String),
    Binary(String),
}

impl From<RawFrame> for WireFrame {
    fn from(frame: RawFrame) -> Self {
        match frame {
            RawFrame::Text(text) => WireFrame::Text(text),
            RawFrame::Binary(data) => {
                WireFrame::Binary(base64::engine::general_purpose::STANDARD.encode(data))
            }
        }
    }
}

impl TryFrom<WireFrame> for RawFrame {
    type Error = ActorError;

    fn try_from(frame: WireFrame) -> Result<Self, Self::Error> {
        match frame {
            WireFrame::Text(text) => Ok(RawFrame::Text(text)),
            WireFrame::Binary(data) => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map(RawFrame::Binary)
                .map_err(|e| ActorError::MalformedMessage(format!("invalid binary frame: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn bodies_are_tagged_by_type() {
        let message = NodeMessage {
            sender_node_id: NodeId::new("n1"),
            message_id: "m1".to_string(),
            body: NodeMessageBody::LeaderAlarm {
                actor_id: ActorId::new("a1"),
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "sender_node_id": "n1",
                "message_id": "m1",
                "body": {"type": "leader_alarm", "actor_id": "a1"}
            })
        );
        assert_eq!(NodeMessage::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn binary_frames_travel_as_base64() {
        let wire = WireFrame::from(RawFrame::Binary(vec![0, 159, 146, 150]));
        assert_eq!(wire, WireFrame::Binary("AJ+Slg==".to_string()));
        assert_eq!(
            RawFrame::try_from(wire).unwrap(),
            RawFrame::Binary(vec![0, 159, 146, 150])
        );

        let err = RawFrame::try_from(WireFrame::Binary("%%%".to_string())).unwrap_err();
        assert_eq!(err.code(), "malformed_message");
    }

    #[test]
    fn garbage_payloads_are_malformed() {
        let err = NodeMessage::decode(b"{\"sender_node_id\": 1}").unwrap_err();
        assert!(matches!(err, ActorError::MalformedMessage(_)));
    }

    #[test]
    fn only_leader_bound_requests_are_acked() {
        let ack = NodeMessageBody::Ack {
            message_id: "m".to_string(),
            success: true,
            error: None,
        };
        assert!(!ack.expects_ack());
        assert!(NodeMessageBody::LeaderAlarm {
            actor_id: ActorId::new("a")
        }
        .expects_ack());
        assert!(!NodeMessageBody::FollowerConnMessage {
            transport_id: "t1".to_string(),
            message: ToClient::Event {
                name: "e".to_string(),
                args: vec![],
            },
        }
        .expects_ack());
    }
}
