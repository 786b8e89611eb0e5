//! Per-node bookkeeping shared by the topology, the message loop and every
//! actor peer.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use troupe::actor::RawSocketSender;
use troupe::actor::RawInbound;
use troupe::{ActorError, ActorId, ConnDriver, ConnId, NodeId, RuntimeContext, SerializedError};

use crate::driver::SharedCoordinateDriver;
use crate::peer::ActorPeer;

/// Result carried by an `Ack` or an `ActionResponse`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<SerializedError>,
}

impl RelayOutcome {
    pub fn ok(output: Option<Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn err(error: &ActorError) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.serialize(true)),
        }
    }

    pub fn into_result(self) -> Result<Option<Value>, ActorError> {
        if self.success {
            Ok(self.output)
        } else {
            Err(self
                .error
                .map(ActorError::from_serialized)
                .unwrap_or_else(|| ActorError::internal("relay failed without an error")))
        }
    }
}

/// A connection whose client transport is on this node while the actor
/// runs on another one. Keyed by transport id: a reconnect parks a second
/// transport for the same conn until the leader closes the first.
#[derive(Clone)]
pub struct RelayedConn {
    pub actor_id: ActorId,
    pub conn_id: ConnId,
    pub driver: Arc<dyn ConnDriver>,
}

/// Follower end of a proxied raw WebSocket.
pub struct FollowerSocket {
    pub actor_id: ActorId,
    pub sender: RawSocketSender,
    pub pump: tokio::task::AbortHandle,
}

/// Leader end of a proxied raw WebSocket.
pub struct LeaderSocket {
    pub actor_id: ActorId,
    pub follower_node_id: NodeId,
    pub inbound: tokio::sync::mpsc::UnboundedSender<RawInbound>,
}

type Waiters = Mutex<HashMap<String, oneshot::Sender<RelayOutcome>>>;

pub struct GlobalState {
    pub node_id: NodeId,
    pub runtime: RuntimeContext,
    pub coordinate: SharedCoordinateDriver,
    pub shutdown: CancellationToken,
    pub(crate) peers: Mutex<HashMap<ActorId, Arc<ActorPeer>>>,
    pending_acks: Waiters,
    pending_responses: Waiters,
    relayed_conns: Mutex<HashMap<String, RelayedConn>>,
    follower_sockets: Mutex<HashMap<String, FollowerSocket>>,
    leader_sockets: Mutex<HashMap<String, LeaderSocket>>,
}

/// Removes a waiter when the waiting side finishes, however it finishes.
pub struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.id);
    }
}

impl GlobalState {
    pub fn new(node_id: NodeId, runtime: RuntimeContext, coordinate: SharedCoordinateDriver) -> Self {
        Self {
            node_id,
            runtime,
            coordinate,
            shutdown: CancellationToken::new(),
            peers: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            relayed_conns: Mutex::new(HashMap::new()),
            follower_sockets: Mutex::new(HashMap::new()),
            leader_sockets: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer(&self, actor_id: &ActorId) -> Option<Arc<ActorPeer>> {
        lock(&self.peers).get(actor_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn register_ack(&self, message_id: &str) -> (WaiterGuard<'_>, oneshot::Receiver<RelayOutcome>) {
        register(&self.pending_acks, message_id)
    }

    pub fn resolve_ack(&self, message_id: &str, outcome: RelayOutcome) -> bool {
        resolve(&self.pending_acks, message_id, outcome)
    }

    pub fn register_response(
        &self,
        request_id: &str,
    ) -> (WaiterGuard<'_>, oneshot::Receiver<RelayOutcome>) {
        register(&self.pending_responses, request_id)
    }

    pub fn resolve_response(&self, request_id: &str, outcome: RelayOutcome) -> bool {
        resolve(&self.pending_responses, request_id, outcome)
    }

    /// Relays still waiting for an ack or a response.
    pub fn pending_relay_count(&self) -> usize {
        lock(&self.pending_acks).len() + lock(&self.pending_responses).len()
    }

    pub fn insert_relayed_conn(&self, transport_id: String, conn: RelayedConn) {
        lock(&self.relayed_conns).insert(transport_id, conn);
    }

    pub fn relayed_conn(&self, transport_id: &str) -> Option<RelayedConn> {
        lock(&self.relayed_conns).get(transport_id).cloned()
    }

    pub fn remove_relayed_conn(&self, transport_id: &str) -> Option<RelayedConn> {
        lock(&self.relayed_conns).remove(transport_id)
    }

    /// Whether any transport of `conn_id` is still relayed from this node.
    pub fn has_relayed_conn(&self, conn_id: &ConnId) -> bool {
        lock(&self.relayed_conns)
            .values()
            .any(|conn| conn.conn_id == *conn_id)
    }

    /// Remove every transport of `conn_id`.
    pub fn remove_relayed_transports(&self, conn_id: &ConnId) -> Vec<(String, RelayedConn)> {
        let mut conns = lock(&self.relayed_conns);
        let ids: Vec<String> = conns
            .iter()
            .filter(|(_, conn)| conn.conn_id == *conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| conns.remove(&id).map(|conn| (id, conn)))
            .collect()
    }

    /// Remove every relayed transport of `actor_id`.
    pub fn drain_relayed_conns(&self, actor_id: &ActorId) -> Vec<(String, RelayedConn)> {
        let mut conns = lock(&self.relayed_conns);
        let ids: Vec<String> = conns
            .iter()
            .filter(|(_, conn)| conn.actor_id == *actor_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| conns.remove(&id).map(|conn| (id, conn)))
            .collect()
    }

    pub fn insert_follower_socket(&self, websocket_id: String, socket: FollowerSocket) {
        lock(&self.follower_sockets).insert(websocket_id, socket);
    }

    /// Forward a frame from the leader to the client. `false` if the socket is gone.
    pub fn send_to_follower_socket(&self, websocket_id: &str, frame: troupe::actor::RawFrame) -> bool {
        lock(&self.follower_sockets)
            .get(websocket_id)
            .is_some_and(|socket| socket.sender.send(frame))
    }

    pub fn remove_follower_socket(&self, websocket_id: &str) -> Option<FollowerSocket> {
        lock(&self.follower_sockets).remove(websocket_id)
    }

    pub fn drain_follower_sockets(&self, actor_id: &ActorId) -> Vec<(String, FollowerSocket)> {
        let mut sockets = lock(&self.follower_sockets);
        let ids: Vec<String> = sockets
            .iter()
            .filter(|(_, socket)| socket.actor_id == *actor_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| sockets.remove(&id).map(|socket| (id, socket)))
            .collect()
    }

    pub fn insert_leader_socket(&self, websocket_id: String, socket: LeaderSocket) {
        lock(&self.leader_sockets).insert(websocket_id, socket);
    }

    /// Deliver a client event to the actor side of a leader socket.
    pub fn send_to_leader_socket(&self, websocket_id: &str, event: RawInbound) -> bool {
        lock(&self.leader_sockets)
            .get(websocket_id)
            .is_some_and(|socket| socket.inbound.send(event).is_ok())
    }

    pub fn remove_leader_socket(&self, websocket_id: &str) -> Option<LeaderSocket> {
        lock(&self.leader_sockets).remove(websocket_id)
    }

    pub fn drain_leader_sockets(&self, actor_id: &ActorId) -> Vec<(String, LeaderSocket)> {
        let mut sockets = lock(&self.leader_sockets);
        let ids: Vec<String> = sockets
            .iter()
            .filter(|(_, socket)| socket.actor_id == *actor_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| sockets.remove(&id).map(|socket| (id, socket)))
            .collect()
    }
}

fn register<'a>(
    waiters: &'a Waiters,
    id: &str,
) -> (WaiterGuard<'a>, oneshot::Receiver<RelayOutcome>) {
    let (tx, rx) = oneshot::channel();
    lock(waiters).insert(id.to_string(), tx);
    (
        WaiterGuard {
            waiters,
            id: id.to_string(),
        },
        rx,
    )
}

fn resolve(waiters: &Waiters, id: &str, outcome: RelayOutcome) -> bool {
    match lock(waiters).remove(id) {
        Some(tx) => tx.send(outcome).is_ok(),
        None => false,
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinateDriver;
    use pretty_assertions::assert_eq;
    use troupe::{ActorRegistry, ManualClock, RuntimeConfig};

    fn state() -> GlobalState {
        let clock = Arc::new(ManualClock::new(0));
        let runtime = RuntimeContext::memory(RuntimeConfig::default(), ActorRegistry::new(), clock.clone());
        GlobalState::new(
            NodeId::new("n1"),
            runtime.context,
            Arc::new(MemoryCoordinateDriver::new(clock)),
        )
    }

    #[tokio::test]
    async fn waiters_are_removed_on_every_exit() {
        let state = state();
        {
            let (_guard, rx) = state.register_ack("m1");
            assert_eq!(state.pending_relay_count(), 1);
            assert!(state.resolve_ack("m1", RelayOutcome::ok(None)));
            assert_eq!(rx.await.unwrap(), RelayOutcome::ok(None));
        }
        {
            let (_guard, _rx) = state.register_response("r1");
            assert_eq!(state.pending_relay_count(), 1);
        }
        assert_eq!(state.pending_relay_count(), 0);
        assert!(!state.resolve_response("r1", RelayOutcome::ok(None)));
    }

    #[test]
    fn outcomes_rebuild_errors() {
        let outcome = RelayOutcome::err(&ActorError::IncorrectConnToken);
        assert_eq!(outcome.into_result().unwrap_err(), ActorError::IncorrectConnToken);
        assert_eq!(
            RelayOutcome::ok(Some(Value::from(3))).into_result().unwrap(),
            Some(Value::from(3))
        );
    }
}
