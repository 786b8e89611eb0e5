//! # Actors
//!
//! Actor definitions, running instances and the connections attached to them.

pub mod conn;
pub mod context;
pub mod definition;
pub mod instance;
pub mod protocol;
pub mod raw_websocket;

pub use conn::{Conn, ConnDriver, ConnDriverKind, ConnFrame, HttpConnDriver, PreparedConn, PushConnDriver};
pub use context::ActionContext;
pub use definition::{arg, ActorDefinition, ActorState, ActorVars, ConnectRequest, RequestInfo};
pub use instance::{ActorInstance, ActorStatus, DynActorInstance, PersistedActor, SharedActorInstance};
pub use protocol::{parse_message, ToClient, ToServer};
pub use raw_websocket::{
    raw_websocket_pair, raw_websocket_pair_with_id, RawFrame, RawInbound, RawOutbound, RawSocketSender,
    RawSocketTransport, RawWebSocket,
};
