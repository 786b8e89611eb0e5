//! Connections whose client transport lives on a follower node.
//!
//! On the follower the client's own driver is parked in the relayed conn
//! table and fed by `FollowerConnMessage`s. On the leader the instance sees
//! a [`RelayConnDriver`] that publishes everything back to the follower.
//!
//! Every follower transport gets its own transport id. Frames and closes
//! name it, so a close for a transport that a reconnect replaced never
//! reaches the new one.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use troupe::id::generate_message_id;
use troupe::{ActorError, ActorId, ConnDriver, ConnDriverKind, ConnId, NodeId, RequestInfo, ToClient};

use crate::global_state::{GlobalState, RelayedConn};
use crate::protocol::NodeMessageBody;
use crate::relay;

enum Outgoing {
    Message(NodeMessageBody),
    Close {
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
}

/// Leader side driver for a conn opened through a follower.
///
/// Messages are forwarded by a single task so the follower sees them in the
/// order the actor sent them. Closing waits until the follower confirms its
/// transport is gone.
pub struct RelayConnDriver {
    kind: ConnDriverKind,
    transport_id: String,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl RelayConnDriver {
    pub fn new(
        global: &Arc<GlobalState>,
        actor_id: ActorId,
        follower_node_id: NodeId,
        kind: ConnDriverKind,
        transport_id: String,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(
            Arc::downgrade(global),
            actor_id,
            follower_node_id,
            transport_id.clone(),
            rx,
        ));
        Self {
            kind,
            transport_id,
            tx,
        }
    }
}

/// Peer reference the leader holds for one follower transport.
pub fn transport_reference(transport_id: &str) -> String {
    format!("relay:{}", transport_id)
}

async fn forward(
    global: Weak<GlobalState>,
    actor_id: ActorId,
    follower: NodeId,
    transport_id: String,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = rx.recv().await {
        let Some(global) = global.upgrade() else {
            return;
        };
        match outgoing {
            Outgoing::Message(body) => {
                if let Err(e) = relay::publish_to_node(&global, &follower, body).await {
                    warn!("Failed to relay message to node {}: {}", follower, e);
                }
            }
            Outgoing::Close { reason, done } => {
                let timeout = global.runtime.config.actor_peer.message_ack_timeout();
                let body = NodeMessageBody::FollowerConnClose {
                    transport_id: transport_id.clone(),
                    reason,
                };
                if let Err(e) = relay::publish_to_node_with_ack(&global, &follower, body, timeout).await {
                    debug!(
                        "Follower {} did not confirm close of transport {}: {}",
                        follower, transport_id, e
                    );
                }
                let _ = done.send(());

                if let Some(peer) = global.peer(&actor_id) {
                    let reference = transport_reference(&transport_id);
                    tokio::spawn(async move { peer.release(&reference).await });
                }
                return;
            }
        }
    }
}

#[async_trait]
impl ConnDriver for RelayConnDriver {
    fn kind(&self) -> ConnDriverKind {
        self.kind
    }

    fn send_message(&self, conn_id: &ConnId, message: &ToClient) {
        let body = NodeMessageBody::FollowerConnMessage {
            transport_id: self.transport_id.clone(),
            message: message.clone(),
        };
        if self.tx.send(Outgoing::Message(body)).is_err() {
            debug!("Relay for conn {} already closed", conn_id);
        }
    }

    async fn disconnect(&self, conn_id: &ConnId, reason: Option<String>) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Outgoing::Close { reason, done }).is_err() {
            debug!("Relay for conn {} already closed", conn_id);
            return;
        }
        let _ = wait.await;
    }
}

/// Follower side: park the client's driver under a fresh transport id and
/// open the conn on the leader.
#[allow(clippy::too_many_arguments)]
pub async fn open_relayed_conn(
    global: &Arc<GlobalState>,
    actor_id: &ActorId,
    conn_id: &ConnId,
    conn_token: &str,
    driver: Arc<dyn ConnDriver>,
    params: Value,
    request: RequestInfo,
    reconnect: bool,
) -> Result<(), ActorError> {
    let transport_id = generate_message_id();
    let driver_kind = driver.kind();
    global.insert_relayed_conn(
        transport_id.clone(),
        RelayedConn {
            actor_id: actor_id.clone(),
            conn_id: conn_id.clone(),
            driver,
        },
    );

    let body = NodeMessageBody::LeaderConnOpen {
        actor_id: actor_id.clone(),
        conn_id: conn_id.clone(),
        conn_token: conn_token.to_string(),
        driver_kind,
        params,
        request,
        reconnect,
        transport_id: transport_id.clone(),
    };
    if let Err(e) = relay::publish_to_leader(global, actor_id, body, None).await {
        global.remove_relayed_conn(&transport_id);
        return Err(e);
    }
    debug!(
        "Conn {} relayed to leader of actor {} over transport {}",
        conn_id, actor_id, transport_id
    );
    Ok(())
}
