//! Raw WebSocket proxying between the node holding the client socket and the
//! actor's leader. The leader only ever sees a logical socket keyed by the
//! generated websocket id.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use troupe::actor::{raw_websocket_pair_with_id, RawFrame, RawInbound, RawOutbound, RawSocketTransport};
use troupe::{ActorError, ActorId, NodeId, SharedActorInstance};

use crate::global_state::{FollowerSocket, GlobalState, LeaderSocket};
use crate::peer::ActorPeer;
use crate::protocol::{NodeMessageBody, WireFrame};
use crate::relay;

const NORMAL_CLOSE_CODE: u16 = 1000;

/// Follower side. The returned transport is bridged to the client socket by
/// the caller; frames travel to the leader without acks.
pub async fn open_follower_socket(
    global: &Arc<GlobalState>,
    actor_id: &ActorId,
    websocket_id: String,
    url: String,
    headers: HashMap<String, String>,
) -> Result<RawSocketTransport, ActorError> {
    let (socket, transport) = raw_websocket_pair_with_id(websocket_id.clone(), url.clone(), headers.clone());
    let (sender, mut inbound) = socket.split();
    let (ready_tx, ready_rx) = oneshot::channel::<bool>();

    let pump = {
        let global = global.clone();
        let actor_id = actor_id.clone();
        let websocket_id = websocket_id.clone();
        tokio::spawn(async move {
            if !ready_rx.await.unwrap_or(false) {
                return;
            }
            while let Some(event) = inbound.recv().await {
                let (body, closing) = match event {
                    RawInbound::Frame(frame) => (
                        NodeMessageBody::LeaderWebSocketMessage {
                            actor_id: actor_id.clone(),
                            websocket_id: websocket_id.clone(),
                            frame: WireFrame::from(frame),
                        },
                        false,
                    ),
                    RawInbound::Close { code, reason } => (
                        NodeMessageBody::LeaderWebSocketClose {
                            actor_id: actor_id.clone(),
                            websocket_id: websocket_id.clone(),
                            code,
                            reason,
                        },
                        true,
                    ),
                };
                if let Err(e) = relay::publish_to_leader_no_retry(&global, &actor_id, body).await {
                    warn!("Dropping frame for raw socket {}: {}", websocket_id, e);
                }
                if closing {
                    break;
                }
            }
            // The client is gone
            if global.remove_follower_socket(&websocket_id).is_some() {
                release(&global, &actor_id, &websocket_id).await;
            }
        })
    };

    global.insert_follower_socket(
        websocket_id.clone(),
        FollowerSocket {
            actor_id: actor_id.clone(),
            sender,
            pump: pump.abort_handle(),
        },
    );

    let body = NodeMessageBody::LeaderWebSocketOpen {
        actor_id: actor_id.clone(),
        websocket_id: websocket_id.clone(),
        url,
        headers,
    };
    if let Err(e) = relay::publish_to_leader(global, actor_id, body, None).await {
        global.remove_follower_socket(&websocket_id);
        pump.abort();
        return Err(e);
    }
    let _ = ready_tx.send(true);
    debug!("Raw socket {} relayed to leader of actor {}", websocket_id, actor_id);
    Ok(transport)
}

/// Leader side of a socket opened by a follower.
pub async fn open_leader_socket(
    global: &Arc<GlobalState>,
    peer: &Arc<ActorPeer>,
    instance: SharedActorInstance,
    follower_node_id: NodeId,
    websocket_id: String,
    url: String,
    headers: HashMap<String, String>,
) -> Result<(), ActorError> {
    let actor_id = peer.actor_id().clone();
    if !peer.retain(&websocket_id) {
        return Err(ActorError::LeaderUnavailable(actor_id.to_string()));
    }

    let (socket, transport) = raw_websocket_pair_with_id(websocket_id.clone(), url, headers);
    let RawSocketTransport {
        inbound,
        mut outbound,
        ..
    } = transport;
    global.insert_leader_socket(
        websocket_id.clone(),
        LeaderSocket {
            actor_id: actor_id.clone(),
            follower_node_id: follower_node_id.clone(),
            inbound,
        },
    );

    if let Err(e) = instance.handle_raw_websocket(socket).await {
        global.remove_leader_socket(&websocket_id);
        peer.release(&websocket_id).await;
        return Err(e);
    }

    let global = global.clone();
    tokio::spawn(async move {
        let mut closed_by_actor = false;
        while let Some(outgoing) = outbound.recv().await {
            let body = match outgoing {
                RawOutbound::Frame(frame) => NodeMessageBody::FollowerWebSocketMessage {
                    websocket_id: websocket_id.clone(),
                    frame: WireFrame::from(frame),
                },
                RawOutbound::Close { code, reason } => {
                    closed_by_actor = true;
                    NodeMessageBody::FollowerWebSocketClose {
                        websocket_id: websocket_id.clone(),
                        code,
                        reason,
                    }
                }
            };
            if let Err(e) = relay::publish_to_node(&global, &follower_node_id, body).await {
                warn!("Failed to relay raw socket {} to node {}: {}", websocket_id, follower_node_id, e);
            }
            if closed_by_actor {
                break;
            }
        }

        // The actor dropped or closed its end
        if global.remove_leader_socket(&websocket_id).is_some() {
            if !closed_by_actor {
                let body = NodeMessageBody::FollowerWebSocketClose {
                    websocket_id: websocket_id.clone(),
                    code: NORMAL_CLOSE_CODE,
                    reason: String::new(),
                };
                let _ = relay::publish_to_node(&global, &follower_node_id, body).await;
            }
            release(&global, &actor_id, &websocket_id).await;
        }
    });
    Ok(())
}

/// A frame from the leader for a client socket on this node.
pub fn deliver_to_client(global: &GlobalState, websocket_id: &str, frame: WireFrame) {
    match RawFrame::try_from(frame) {
        Ok(frame) => {
            if !global.send_to_follower_socket(websocket_id, frame) {
                debug!("Raw socket {} is gone, dropping frame", websocket_id);
            }
        }
        Err(e) => warn!("Bad frame for raw socket {}: {}", websocket_id, e),
    }
}

/// The leader closed a socket whose client is on this node.
pub async fn close_from_leader(global: &Arc<GlobalState>, websocket_id: &str, code: u16, reason: String) {
    if let Some(socket) = global.remove_follower_socket(websocket_id) {
        socket.pump.abort();
        socket.sender.close(code, reason);
        release(global, &socket.actor_id, websocket_id).await;
    }
}

/// A frame from a follower for the actor side of a socket on this node.
pub fn deliver_to_actor(global: &GlobalState, websocket_id: &str, frame: WireFrame) {
    match RawFrame::try_from(frame) {
        Ok(frame) => {
            if !global.send_to_leader_socket(websocket_id, RawInbound::Frame(frame)) {
                debug!("Raw socket {} is gone on the leader, dropping frame", websocket_id);
            }
        }
        Err(e) => warn!("Bad frame for raw socket {}: {}", websocket_id, e),
    }
}

/// The client of a relayed socket went away.
pub async fn close_from_follower(global: &Arc<GlobalState>, websocket_id: &str, code: u16, reason: String) {
    if let Some(socket) = global.remove_leader_socket(websocket_id) {
        let _ = socket.inbound.send(RawInbound::Close { code, reason });
        release(global, &socket.actor_id, websocket_id).await;
    }
}

async fn release(global: &Arc<GlobalState>, actor_id: &ActorId, reference: &str) {
    if let Some(peer) = global.peer(actor_id) {
        peer.release(reference).await;
    }
}
