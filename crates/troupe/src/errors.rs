//! # Errors
//!
//! Error taxonomy shared by every layer of the runtime.
//!
//! Each [`ActorError`] is either **public** or **internal**. Public errors are
//! safe to describe to a client and are serialized with a stable code, a
//! human readable message and optional metadata. Internal errors are logged in
//! full on the server and masked as a generic `internal_error` unless the
//! receiving side is trusted (for example another node relaying the call).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const INTERNAL_ERROR_CODE: &str = "internal_error";
pub const INTERNAL_ERROR_DESCRIPTION: &str =
    "Internal error. Read the server logs for more details.";

/// # ActorError
///
/// Errors surfaced by actor instances, connections, the scheduler and the
/// relay layer. These errors cross the network, so every variant maps onto a
/// stable code via [`ActorError::code`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActorError {
    /// No actor record exists for the given id
    #[error("Actor not found: {0}")]
    ActorNotFound(String),

    /// The `(name, key)` pair is already taken by another actor
    #[error("Actor already exists: {name} {key:?}")]
    ActorAlreadyExists { name: String, key: Vec<String> },

    #[error("Connection not found for ID `{0}`")]
    ConnNotFound(String),

    /// The connection token presented does not match the one issued at connect time
    #[error("Incorrect connection token")]
    IncorrectConnToken,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too long")]
    MessageTooLong,

    #[error("Connection parameters too long")]
    ConnParamsTooLong,

    /// The action name is not present in the actor's action table
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// The action did not finish within its configured execution timeout
    #[error("Action timed out")]
    ActionTimedOut,

    #[error("Actor not ready")]
    ActorNotReady,

    #[error("Actor stopped")]
    ActorStopped,

    #[error("Attempted to set invalid state. State must be JSON serializable: {0}")]
    InvalidStateType(String),

    /// The leader never acknowledged or answered a relayed message
    #[error("Relay to actor leader timed out")]
    RelayTimedOut,

    /// The caller gave up on the request
    #[error("Request aborted")]
    Aborted,

    /// No leader is currently reachable for the actor
    #[error("Actor leader unavailable: {0}")]
    LeaderUnavailable(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// Error raised by user code with a stable, client facing code
    #[error("{message}")]
    User {
        code: String,
        message: String,
        metadata: Option<Value>,
    },

    /// An internal invariant was violated
    #[error("Unreachable case: {0}")]
    Unreachable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire representation of an [`ActorError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ActorError {
    /// Create a public error from user code
    pub fn user(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::User {
            code: code.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn user_with_metadata(
        code: impl Into<String>,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self::User {
            code: code.into(),
            message: message.into(),
            metadata: Some(metadata),
        }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }

    pub fn code(&self) -> &str {
        match self {
            Self::ActorNotFound(_) => "actor_not_found",
            Self::ActorAlreadyExists { .. } => "actor_already_exists",
            Self::ConnNotFound(_) => "conn_not_found",
            Self::IncorrectConnToken => "incorrect_conn_token",
            Self::MalformedMessage(_) => "malformed_message",
            Self::MessageTooLong => "message_too_long",
            Self::ConnParamsTooLong => "conn_params_too_long",
            Self::ActionNotFound(_) => "action_not_found",
            Self::ActionTimedOut => "action_timed_out",
            Self::ActorNotReady => "actor_not_ready",
            Self::ActorStopped => "actor_stopped",
            Self::InvalidStateType(_) => "invalid_state_type",
            Self::RelayTimedOut => "relay_timed_out",
            Self::Aborted => "aborted",
            Self::LeaderUnavailable(_) => "leader_unavailable",
            Self::Unsupported(_) => "unsupported",
            Self::User { code, .. } => code,
            Self::Unreachable(_) | Self::Internal(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Whether the error may be described to an untrusted caller.
    pub fn is_public(&self) -> bool {
        match self {
            Self::ActorNotFound(_)
            | Self::ActorAlreadyExists { .. }
            | Self::ConnNotFound(_)
            | Self::IncorrectConnToken
            | Self::MalformedMessage(_)
            | Self::MessageTooLong
            | Self::ConnParamsTooLong
            | Self::ActionNotFound(_)
            | Self::ActionTimedOut
            | Self::ActorStopped
            | Self::RelayTimedOut
            | Self::Aborted
            | Self::LeaderUnavailable(_)
            | Self::User { .. } => true,
            Self::ActorNotReady
            | Self::InvalidStateType(_)
            | Self::Unsupported(_)
            | Self::Unreachable(_)
            | Self::Internal(_) => false,
        }
    }

    /// Timeouts on either clock (action execution or relay ack).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ActionTimedOut | Self::RelayTimedOut)
    }

    pub fn metadata(&self) -> Option<&Value> {
        match self {
            Self::User { metadata, .. } => metadata.as_ref(),
            _ => None,
        }
    }

    /// HTTP status used by the router layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ActionTimedOut | Self::RelayTimedOut => 408,
            Self::ActorNotFound(_) | Self::ConnNotFound(_) | Self::ActionNotFound(_) => 404,
            Self::IncorrectConnToken => 403,
            Self::LeaderUnavailable(_) => 503,
            _ if self.is_public() => 400,
            _ => 500,
        }
    }

    /// Metadata sent over the wire. Variants with structured fields carry
    /// them here so the receiving side can rebuild the variant.
    fn wire_metadata(&self) -> Option<Value> {
        match self {
            Self::ActorAlreadyExists { name, key } => Some(json!({ "name": name, "key": key })),
            _ => self.metadata().cloned(),
        }
    }

    /// Serialize for a caller. Internal errors are masked unless `trusted`.
    pub fn serialize(&self, trusted: bool) -> SerializedError {
        if self.is_public() || trusted {
            SerializedError {
                code: self.code().to_string(),
                message: self.to_string(),
                metadata: self.wire_metadata(),
            }
        } else {
            SerializedError {
                code: INTERNAL_ERROR_CODE.to_string(),
                message: INTERNAL_ERROR_DESCRIPTION.to_string(),
                metadata: None,
            }
        }
    }

    /// Rebuild an error received over the wire.
    ///
    /// Codes of the built-in taxonomy map back onto their variant so that, for
    /// example, a timeout on the leader is still a timeout on the follower.
    /// Variant payloads are recovered from the display message, so a relayed
    /// error reads the same on every node.
    pub fn from_serialized(err: SerializedError) -> Self {
        let SerializedError {
            code,
            message,
            metadata,
        } = err;
        match code.as_str() {
            "actor_not_found" => Self::ActorNotFound(detail(message, "Actor not found: ", "")),
            "actor_already_exists" => {
                match metadata.and_then(|m| serde_json::from_value::<ActorKeyMetadata>(m).ok()) {
                    Some(ActorKeyMetadata { name, key }) => Self::ActorAlreadyExists { name, key },
                    None => Self::ActorAlreadyExists {
                        name: detail(message, "Actor already exists: ", ""),
                        key: Vec::new(),
                    },
                }
            }
            "conn_not_found" => {
                Self::ConnNotFound(detail(message, "Connection not found for ID `", "`"))
            }
            "incorrect_conn_token" => Self::IncorrectConnToken,
            "malformed_message" => Self::MalformedMessage(detail(message, "Malformed message: ", "")),
            "message_too_long" => Self::MessageTooLong,
            "conn_params_too_long" => Self::ConnParamsTooLong,
            "action_not_found" => Self::ActionNotFound(detail(message, "Action not found: ", "")),
            "action_timed_out" => Self::ActionTimedOut,
            "actor_not_ready" => Self::ActorNotReady,
            "actor_stopped" => Self::ActorStopped,
            "relay_timed_out" => Self::RelayTimedOut,
            "aborted" => Self::Aborted,
            "leader_unavailable" => {
                Self::LeaderUnavailable(detail(message, "Actor leader unavailable: ", ""))
            }
            "unsupported" => Self::Unsupported(detail(message, "Unsupported feature: ", "")),
            "invalid_state_type" => Self::InvalidStateType(detail(
                message,
                "Attempted to set invalid state. State must be JSON serializable: ",
                "",
            )),
            INTERNAL_ERROR_CODE => Self::Internal(detail(message, "Internal error: ", "")),
            _ => Self::User {
                code,
                message,
                metadata,
            },
        }
    }
}

#[derive(Deserialize)]
struct ActorKeyMetadata {
    name: String,
    key: Vec<String>,
}

/// Strip the fixed text a variant's display adds around its payload.
fn detail(message: String, prefix: &str, suffix: &str) -> String {
    message
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(suffix))
        .map(str::to_string)
        .unwrap_or(message)
}

/// # DriverError
///
/// Failures reported by persistence, manager and coordination backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Actor does not exist: {0}")]
    ActorNotFound(String),

    #[error("Actor already exists: {name} {key:?}")]
    ActorAlreadyExists { name: String, key: Vec<String> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// The node channel used by the coordination backend is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<DriverError> for ActorError {
    fn from(error: DriverError) -> Self {
        match error {
            DriverError::ActorNotFound(id) => ActorError::ActorNotFound(id),
            DriverError::ActorAlreadyExists { name, key } => {
                ActorError::ActorAlreadyExists { name, key }
            }
            other => ActorError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(error: serde_json::Error) -> Self {
        DriverError::Serialization(error.to_string())
    }
}
