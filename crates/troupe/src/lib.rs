//! # Troupe
//!
//! An actor runtime. Each actor is addressed by a name and a key, owns
//! serializable state, and is reachable from many concurrent client
//! connections over WebSocket, SSE or plain HTTP.
//!
//! ## Core Components
//!
//! * [`actor`] - actor definitions, running instances and connections
//! * [`schedule`] - durable delayed callbacks backed by a single platform alarm
//! * [`driver`] / [`manager`] - the storage interfaces a backend implements
//! * [`standalone`] - a topology that runs every actor in this process
//!
//! Multi-process deployments, where one node holds a lease on each actor and
//! the others relay to it, live in the `troupe-coordinate` crate.

pub mod actor;
pub mod clock;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod errors;
pub mod id;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod runtime;
pub mod schedule;
pub mod standalone;
pub mod topology;

pub use actor::{
    arg, ActionContext, ActorDefinition, ActorInstance, ActorStatus, Conn, ConnDriver,
    ConnDriverKind, DynActorInstance, RequestInfo, SharedActorInstance, ToClient, ToServer,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use config::{ActorOptions, ActorPeerConfig, RelayRetryConfig, RuntimeConfig};
pub use driver::{ActorDriver, AlarmTarget, SharedActorDriver};
pub use errors::{ActorError, DriverError, SerializedError};
pub use id::{ActorId, ActorKey, ConnId, NodeId};
pub use manager::{ActorRecord, ManagerDriver, SharedManagerDriver};
pub use registry::ActorRegistry;
pub use runtime::{MemoryRuntime, RuntimeContext};
pub use schedule::Scheduler;
pub use standalone::StandaloneTopology;
pub use topology::{execute_http_action, ConnectedConn, SharedTopology, Topology};
