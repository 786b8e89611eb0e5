//! # Troupe Coordinate
//!
//! Runs troupe actors across many nodes. Every node that touches an actor
//! keeps an [`ActorPeer`] for it; the peers compete for a lease in the
//! coordinate driver and exactly one of them, the leader, runs the actor.
//! Followers relay actions, connection traffic, raw WebSocket frames and
//! alarms to the leader over node-to-node messages, and take over when the
//! leader's lease expires.
//!
//! ## Core Components
//!
//! * [`driver`] - the lease and pub/sub interface a coordination backend implements
//! * [`memory`] - an in-process backend for tests and single-host clusters
//! * [`peer`] - per-actor leader election and reference counting
//! * [`relay`] - acknowledged, retried delivery to an actor's leader
//! * [`topology`] - the [`troupe::Topology`] built on top of all of the above

pub mod driver;
pub mod global_state;
pub mod memory;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod raw_websocket;
pub mod relay;
pub mod relay_conn;
pub mod topology;

pub use driver::{CoordinateDriver, Lease, SharedCoordinateDriver};
pub use global_state::{GlobalState, RelayOutcome};
pub use memory::MemoryCoordinateDriver;
pub use peer::{ActorPeer, PeerState, LEADER_CHANGED_CLOSE_CODE, LEADER_CHANGED_REASON};
pub use protocol::{NodeMessage, NodeMessageBody, WireFrame};
pub use relay_conn::RelayConnDriver;
pub use topology::CoordinateTopology;
