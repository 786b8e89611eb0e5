//! In-process coordinate backend shared by every node of a test cluster.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use troupe::{ActorId, DriverError, NodeId, SharedClock, SystemClock};

use crate::driver::{CoordinateDriver, Lease};

#[derive(Default)]
struct Tables {
    leases: HashMap<ActorId, Lease>,
    nodes: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    dead: HashSet<NodeId>,
}

pub struct MemoryCoordinateDriver {
    clock: SharedClock,
    tables: Mutex<Tables>,
}

impl MemoryCoordinateDriver {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Simulate a crash: the node's channel closes, messages addressed to it
    /// vanish and every operation it issues fails from now on. Its leases
    /// stay in place until they expire.
    pub fn kill_node(&self, node_id: &NodeId) {
        let mut tables = self.lock();
        tables.nodes.remove(node_id);
        tables.dead.insert(node_id.clone());
        info!("Node {} killed", node_id);
    }

    pub fn lease(&self, actor_id: &ActorId) -> Option<Lease> {
        self.lock().leases.get(actor_id).cloned()
    }

    /// Hand the lease to `node_id` regardless of who holds it, as a backend
    /// that lost a write would. The previous holder learns on its next renew.
    pub fn reassign_lease(&self, actor_id: &ActorId, node_id: &NodeId, lease_duration_ms: u64) {
        let now = self.clock.now_ms();
        self.lock().leases.insert(
            actor_id.clone(),
            Lease {
                actor_id: actor_id.clone(),
                leader_node_id: node_id.clone(),
                expires_at: now + lease_duration_ms as i64,
            },
        );
        info!("Lease for {} reassigned to {}", actor_id, node_id);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_alive(tables: &Tables, node_id: &NodeId) -> Result<(), DriverError> {
        if tables.dead.contains(node_id) {
            return Err(DriverError::Backend(format!("node {} is down", node_id)));
        }
        Ok(())
    }
}

impl Default for MemoryCoordinateDriver {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl CoordinateDriver for MemoryCoordinateDriver {
    async fn subscribe(&self, node_id: &NodeId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, DriverError> {
        let mut tables = self.lock();
        Self::ensure_alive(&tables, node_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tables.nodes.insert(node_id.clone(), tx);
        debug!("Node {} subscribed", node_id);
        Ok(rx)
    }

    async fn publish_to_node(
        &self,
        sender: &NodeId,
        target: &NodeId,
        payload: Vec<u8>,
    ) -> Result<(), DriverError> {
        let tables = self.lock();
        Self::ensure_alive(&tables, sender)?;
        match tables.nodes.get(target) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    trace!("Node {} stopped listening, dropping message", target);
                }
            }
            None => trace!("No subscriber for node {}, dropping message", target),
        }
        Ok(())
    }

    async fn get_actor_leader(&self, actor_id: &ActorId) -> Result<Option<Lease>, DriverError> {
        Ok(self.lock().leases.get(actor_id).cloned())
    }

    async fn attempt_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: &NodeId,
        lease_duration_ms: u64,
    ) -> Result<Lease, DriverError> {
        let now = self.clock.now_ms();
        let mut tables = self.lock();
        Self::ensure_alive(&tables, node_id)?;

        let claimable = match tables.leases.get(actor_id) {
            None => true,
            Some(lease) => lease.leader_node_id == *node_id || lease.is_expired(now),
        };
        if claimable {
            tables.leases.insert(
                actor_id.clone(),
                Lease {
                    actor_id: actor_id.clone(),
                    leader_node_id: node_id.clone(),
                    expires_at: now + lease_duration_ms as i64,
                },
            );
        }
        tables
            .leases
            .get(actor_id)
            .cloned()
            .ok_or_else(|| DriverError::Backend(format!("lease for {} vanished", actor_id)))
    }

    async fn extend_lease(
        &self,
        actor_id: &ActorId,
        node_id: &NodeId,
        lease_duration_ms: u64,
    ) -> Result<bool, DriverError> {
        let now = self.clock.now_ms();
        let mut tables = self.lock();
        Self::ensure_alive(&tables, node_id)?;
        match tables.leases.get_mut(actor_id) {
            Some(lease) if lease.leader_node_id == *node_id => {
                lease.expires_at = now + lease_duration_ms as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, actor_id: &ActorId, node_id: &NodeId) -> Result<(), DriverError> {
        let mut tables = self.lock();
        Self::ensure_alive(&tables, node_id)?;
        if tables
            .leases
            .get(actor_id)
            .is_some_and(|lease| lease.leader_node_id == *node_id)
        {
            tables.leases.remove(actor_id);
        }
        Ok(())
    }
}
