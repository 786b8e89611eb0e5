//! # Coordinate Driver
//!
//! The shared backend every node talks to: a lease table deciding which node
//! leads each actor, and a per-node message channel. Nodes never connect to
//! each other directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use troupe::{ActorId, DriverError, NodeId};

/// Current holder of an actor's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub actor_id: ActorId,
    pub leader_node_id: NodeId,
    /// Unix milliseconds after which the lease may be taken over
    pub expires_at: i64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

#[async_trait]
pub trait CoordinateDriver: Send + Sync + 'static {
    /// Open the inbound channel of `node_id`. Payloads are encoded
    /// [`NodeMessage`](crate::protocol::NodeMessage)s.
    async fn subscribe(&self, node_id: &NodeId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, DriverError>;

    /// Deliver a payload to another node. Delivery is best effort; a missing
    /// receiver is not an error.
    async fn publish_to_node(
        &self,
        sender: &NodeId,
        target: &NodeId,
        payload: Vec<u8>,
    ) -> Result<(), DriverError>;

    async fn get_actor_leader(&self, actor_id: &ActorId) -> Result<Option<Lease>, DriverError>;

    /// Atomically claim the lease if it is absent, expired or already held
    /// by `node_id`. Returns the lease as it stands afterwards, which names
    /// another node when the claim lost.
    async fn attempt_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: &NodeId,
        lease_duration_ms: u64,
    ) -> Result<Lease, DriverError>;

    /// Push the expiry forward. `false` when another node holds the lease.
    async fn extend_lease(
        &self,
        actor_id: &ActorId,
        node_id: &NodeId,
        lease_duration_ms: u64,
    ) -> Result<bool, DriverError>;

    /// Drop the lease if `node_id` still holds it.
    async fn release_lease(&self, actor_id: &ActorId, node_id: &NodeId) -> Result<(), DriverError>;
}

pub type SharedCoordinateDriver = Arc<dyn CoordinateDriver>;
