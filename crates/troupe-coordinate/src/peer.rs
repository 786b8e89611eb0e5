//! # Actor Peer
//!
//! One peer exists per actor on every node that currently touches the actor.
//! The peer decides, through the coordinate driver's lease, whether this node
//! runs the actor (leader) or relays to the node that does (follower).
//!
//! ## Lifecycle
//!
//! `Unacquired -> Acquiring -> Leader | Follower`. A leader renews its lease
//! `lease_duration - renew_lease_grace` after each write and demotes itself
//! when a renewal fails. A follower re-checks the lease every
//! `check_lease_interval` plus random jitter and takes over once the lease
//! expires.
//!
//! Peers are reference counted by the ids of the connections, sockets and
//! requests using them. When the last reference is released the peer stops
//! its instance, gives up its lease and removes itself.

use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use troupe::{ActorError, ActorId, NodeId, SharedActorInstance};

use crate::global_state::{lock, GlobalState};
use crate::protocol::NodeMessageBody;
use crate::relay;

/// Close code sent to raw sockets whose actor moved to another node.
pub const LEADER_CHANGED_CLOSE_CODE: u16 = 1001;
pub const LEADER_CHANGED_REASON: &str = "Actor leader changed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Unacquired,
    Acquiring,
    Leader,
    Follower { leader: NodeId },
}

pub struct ActorPeer {
    actor_id: ActorId,
    global: Arc<GlobalState>,
    state: Mutex<PeerState>,
    acquired: OnceCell<()>,
    instance: Mutex<Option<SharedActorInstance>>,
    references: Mutex<HashSet<String>>,
    disposing: AtomicBool,
    heartbeat: CancellationToken,
    torn_down: CancellationToken,
}

impl ActorPeer {
    fn new(global: Arc<GlobalState>, actor_id: ActorId) -> Self {
        let heartbeat = global.shutdown.child_token();
        Self {
            actor_id,
            global,
            state: Mutex::new(PeerState::Unacquired),
            acquired: OnceCell::new(),
            instance: Mutex::new(None),
            references: Mutex::new(HashSet::new()),
            disposing: AtomicBool::new(false),
            heartbeat,
            torn_down: CancellationToken::new(),
        }
    }

    /// Get or create the peer for `actor_id`, hold `reference` on it and
    /// wait until it knows who leads the actor.
    ///
    /// Concurrent callers share one acquisition. A peer that is being torn
    /// down is waited out and replaced.
    pub async fn acquire(
        global: &Arc<GlobalState>,
        actor_id: &ActorId,
        reference: &str,
    ) -> Result<Arc<ActorPeer>, ActorError> {
        loop {
            if global.shutdown.is_cancelled() {
                return Err(ActorError::ActorStopped);
            }

            let claimed = {
                let mut peers = lock(&global.peers);
                match peers.get(actor_id) {
                    Some(peer) if peer.is_disposing() => Err(peer.clone()),
                    Some(peer) => {
                        lock(&peer.references).insert(reference.to_string());
                        Ok(peer.clone())
                    }
                    None => {
                        let peer = Arc::new(ActorPeer::new(global.clone(), actor_id.clone()));
                        lock(&peer.references).insert(reference.to_string());
                        peers.insert(actor_id.clone(), peer.clone());
                        Ok(peer)
                    }
                }
            };

            match claimed {
                Ok(peer) => {
                    if let Err(e) = peer.ensure_acquired().await {
                        peer.release(reference).await;
                        return Err(e);
                    }
                    return Ok(peer);
                }
                Err(disposing) => {
                    debug!("Waiting for peer of actor {} to be torn down", actor_id);
                    disposing.torn_down.cancelled().await;
                }
            }
        }
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn state(&self) -> PeerState {
        lock(&self.state).clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == PeerState::Leader
    }

    pub fn leader_node_id(&self) -> Option<NodeId> {
        match self.state() {
            PeerState::Leader => Some(self.global.node_id.clone()),
            PeerState::Follower { leader } => Some(leader),
            _ => None,
        }
    }

    /// The running instance, if this node leads the actor.
    pub fn leader_instance(&self) -> Option<SharedActorInstance> {
        if self.is_disposing() || !self.is_leader() {
            return None;
        }
        lock(&self.instance).clone()
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    pub fn reference_count(&self) -> usize {
        lock(&self.references).len()
    }

    /// Hold an extra reference on an already acquired peer. `false` once the
    /// peer is being torn down.
    pub fn retain(&self, reference: &str) -> bool {
        let _peers = lock(&self.global.peers);
        if self.is_disposing() {
            return false;
        }
        lock(&self.references).insert(reference.to_string());
        true
    }

    /// Drop a reference. The last one disposes the peer.
    pub async fn release(self: &Arc<Self>, reference: &str) {
        let dispose = {
            let _peers = lock(&self.global.peers);
            let mut references = lock(&self.references);
            references.remove(reference);
            references.is_empty() && self.begin_dispose()
        };
        if dispose {
            debug!("Last reference to actor {} released", self.actor_id);
            self.finish_dispose().await;
        }
    }

    /// Tear the peer down regardless of its references.
    pub async fn dispose(self: &Arc<Self>) {
        let first = {
            let _peers = lock(&self.global.peers);
            self.begin_dispose()
        };
        if first {
            self.finish_dispose().await;
        } else {
            self.torn_down.cancelled().await;
        }
    }

    async fn ensure_acquired(self: &Arc<Self>) -> Result<(), ActorError> {
        self.acquired
            .get_or_try_init(|| self.run_acquire())
            .await
            .map(|_| ())
    }

    async fn run_acquire(self: &Arc<Self>) -> Result<(), ActorError> {
        self.set_state(PeerState::Acquiring);
        let lease_ms = self.global.runtime.config.actor_peer.lease_duration_ms;
        let lease = match self
            .global
            .coordinate
            .attempt_acquire_lease(&self.actor_id, &self.global.node_id, lease_ms)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.set_state(PeerState::Unacquired);
                return Err(e.into());
            }
        };

        if lease.leader_node_id == self.global.node_id {
            if let Err(e) = self.become_leader().await {
                error!("Failed to start actor {} as leader: {}", self.actor_id, e);
                self.release_lease().await;
                self.set_state(PeerState::Unacquired);
                return Err(e);
            }
        } else {
            info!(
                "Node {} follows {} for actor {}",
                self.global.node_id, lease.leader_node_id, self.actor_id
            );
            self.set_state(PeerState::Follower {
                leader: lease.leader_node_id,
            });
        }

        let peer = self.clone();
        tokio::spawn(async move { peer.heartbeat_loop().await });
        Ok(())
    }

    async fn become_leader(&self) -> Result<(), ActorError> {
        let instance = self.global.runtime.create_instance(&self.actor_id).await?;
        instance.start().await?;
        *lock(&self.instance) = Some(instance);
        self.set_state(PeerState::Leader);
        info!("Node {} leads actor {}", self.global.node_id, self.actor_id);
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let config = self.global.runtime.config.actor_peer.clone();
        loop {
            let delay = match self.state() {
                PeerState::Leader => config.renew_interval(),
                PeerState::Follower { .. } => {
                    let jitter = rand::thread_rng().gen_range(0..=config.check_lease_jitter_ms);
                    config.check_lease_interval() + Duration::from_millis(jitter)
                }
                PeerState::Unacquired | PeerState::Acquiring => return,
            };

            tokio::select! {
                _ = self.heartbeat.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let keep_going = match self.state() {
                PeerState::Leader => self.renew_lease().await,
                PeerState::Follower { leader } => self.check_lease(leader).await,
                PeerState::Unacquired | PeerState::Acquiring => false,
            };
            if !keep_going {
                return;
            }
        }
    }

    async fn renew_lease(self: &Arc<Self>) -> bool {
        let lease_ms = self.global.runtime.config.actor_peer.lease_duration_ms;
        match self
            .global
            .coordinate
            .extend_lease(&self.actor_id, &self.global.node_id, lease_ms)
            .await
        {
            Ok(true) => {
                trace!("Renewed lease on actor {}", self.actor_id);
                true
            }
            Ok(false) => {
                warn!(
                    "Node {} lost the lease on actor {}, demoting",
                    self.global.node_id, self.actor_id
                );
                self.dispose().await;
                false
            }
            Err(e) => {
                warn!(
                    "Failed to renew lease on actor {}: {}, demoting",
                    self.actor_id, e
                );
                self.dispose().await;
                false
            }
        }
    }

    async fn check_lease(self: &Arc<Self>, current_leader: NodeId) -> bool {
        let lease_ms = self.global.runtime.config.actor_peer.lease_duration_ms;
        let lease = match self
            .global
            .coordinate
            .attempt_acquire_lease(&self.actor_id, &self.global.node_id, lease_ms)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to check lease on actor {}: {}", self.actor_id, e);
                return true;
            }
        };

        if lease.leader_node_id == current_leader {
            return true;
        }

        info!(
            "Leader of actor {} changed from {} to {}",
            self.actor_id, current_leader, lease.leader_node_id
        );
        self.close_relayed().await;

        if lease.leader_node_id == self.global.node_id {
            if let Err(e) = self.become_leader().await {
                error!("Failed to take over actor {}: {}", self.actor_id, e);
                self.dispose().await;
                return false;
            }
        } else {
            self.set_state(PeerState::Follower {
                leader: lease.leader_node_id,
            });
        }

        if self.reference_count() == 0 {
            self.dispose().await;
            return false;
        }
        true
    }

    /// Close every client transport this node relays to the old leader.
    /// Clients reconnect and land on the new one.
    async fn close_relayed(&self) {
        for (_, conn) in self.global.drain_relayed_conns(&self.actor_id) {
            conn.driver
                .disconnect(&conn.conn_id, Some(LEADER_CHANGED_REASON.to_string()))
                .await;
            lock(&self.references).remove(&conn.conn_id.to_string());
        }
        for (websocket_id, socket) in self.global.drain_follower_sockets(&self.actor_id) {
            socket.pump.abort();
            socket
                .sender
                .close(LEADER_CHANGED_CLOSE_CODE, LEADER_CHANGED_REASON);
            lock(&self.references).remove(&websocket_id);
        }
    }

    fn begin_dispose(&self) -> bool {
        !self.disposing.swap(true, Ordering::SeqCst)
    }

    async fn finish_dispose(self: &Arc<Self>) {
        self.heartbeat.cancel();
        let was_leader = self.is_leader();

        let instance = lock(&self.instance).take();
        if let Some(instance) = instance {
            if let Err(e) = instance.stop().await {
                error!("Failed to stop actor {}: {}", self.actor_id, e);
            }
        }

        for (websocket_id, socket) in self.global.drain_leader_sockets(&self.actor_id) {
            let body = NodeMessageBody::FollowerWebSocketClose {
                websocket_id,
                code: LEADER_CHANGED_CLOSE_CODE,
                reason: LEADER_CHANGED_REASON.to_string(),
            };
            if let Err(e) = relay::publish_to_node(&self.global, &socket.follower_node_id, body).await {
                debug!("Failed to close relayed socket: {}", e);
            }
        }
        self.close_relayed().await;

        if was_leader {
            self.release_lease().await;
        }
        self.set_state(PeerState::Unacquired);

        {
            let mut peers = lock(&self.global.peers);
            if peers
                .get(&self.actor_id)
                .is_some_and(|peer| Arc::ptr_eq(peer, self))
            {
                peers.remove(&self.actor_id);
            }
        }
        self.torn_down.cancel();
        debug!("Peer for actor {} disposed", self.actor_id);
    }

    async fn release_lease(&self) {
        if let Err(e) = self
            .global
            .coordinate
            .release_lease(&self.actor_id, &self.global.node_id)
            .await
        {
            warn!("Failed to release lease on actor {}: {}", self.actor_id, e);
        }
    }

    fn set_state(&self, state: PeerState) {
        *lock(&self.state) = state;
    }
}
