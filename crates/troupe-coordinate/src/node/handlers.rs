use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use troupe::{
    execute_http_action, ActorError, ActorId, ConnDriver, ConnDriverKind, ConnId, NodeId,
    RequestInfo, SharedActorInstance,
};

use crate::global_state::{GlobalState, RelayOutcome};
use crate::peer::ActorPeer;
use crate::protocol::{NodeMessage, NodeMessageBody};
use crate::raw_websocket;
use crate::relay::{self, send_ack};
use crate::relay_conn::{transport_reference, RelayConnDriver};

pub(crate) async fn handle_message(global: &Arc<GlobalState>, message: NodeMessage) {
    let NodeMessage {
        sender_node_id: sender,
        message_id,
        body,
    } = message;
    trace!(
        "Node {} received {} from {} (ack: {})",
        global.node_id,
        body.kind(),
        sender,
        body.expects_ack()
    );

    match body {
        NodeMessageBody::Ack {
            message_id,
            success,
            error,
        } => {
            let outcome = RelayOutcome {
                success,
                output: None,
                error,
            };
            if !global.resolve_ack(&message_id, outcome) {
                debug!("Ack for {} arrived after its waiter left", message_id);
            }
        }

        NodeMessageBody::ActionResponse {
            request_id,
            success,
            output,
            error,
        } => {
            let outcome = RelayOutcome {
                success,
                output,
                error,
            };
            if !global.resolve_response(&request_id, outcome) {
                debug!("Response for {} arrived after its waiter left", request_id);
            }
        }

        NodeMessageBody::FollowerConnMessage { transport_id, message } => {
            match global.relayed_conn(&transport_id) {
                Some(conn) => conn.driver.send_message(&conn.conn_id, &message),
                None => debug!("No relayed transport {}, dropping message", transport_id),
            }
        }

        NodeMessageBody::FollowerConnClose { transport_id, reason } => {
            let global = global.clone();
            tokio::spawn(async move {
                if let Some(conn) = global.remove_relayed_conn(&transport_id) {
                    conn.driver.disconnect(&conn.conn_id, reason).await;
                    // A reconnect may have parked a newer transport for the same conn
                    if !global.has_relayed_conn(&conn.conn_id) {
                        if let Some(peer) = global.peer(&conn.actor_id) {
                            peer.release(&conn.conn_id.to_string()).await;
                        }
                    }
                }
                send_ack(&global, &sender, message_id, Ok(())).await;
            });
        }

        NodeMessageBody::FollowerWebSocketMessage {
            websocket_id,
            frame,
        } => raw_websocket::deliver_to_client(global, &websocket_id, frame),

        NodeMessageBody::FollowerWebSocketClose {
            websocket_id,
            code,
            reason,
        } => raw_websocket::close_from_leader(global, &websocket_id, code, reason).await,

        NodeMessageBody::LeaderWebSocketMessage {
            websocket_id,
            frame,
            ..
        } => raw_websocket::deliver_to_actor(global, &websocket_id, frame),

        NodeMessageBody::LeaderWebSocketClose {
            websocket_id,
            code,
            reason,
            ..
        } => raw_websocket::close_from_follower(global, &websocket_id, code, reason).await,

        NodeMessageBody::LeaderWebSocketOpen {
            actor_id,
            websocket_id,
            url,
            headers,
        } => {
            let global = global.clone();
            tokio::spawn(async move {
                let result = match leader_of(&global, &actor_id) {
                    Ok((peer, instance)) => {
                        raw_websocket::open_leader_socket(
                            &global,
                            &peer,
                            instance,
                            sender.clone(),
                            websocket_id,
                            url,
                            headers,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                send_ack(&global, &sender, message_id, result).await;
            });
        }

        NodeMessageBody::LeaderConnOpen {
            actor_id,
            conn_id,
            conn_token,
            driver_kind,
            params,
            request,
            reconnect,
            transport_id,
        } => {
            let global = global.clone();
            tokio::spawn(async move {
                let result = open_conn(
                    &global,
                    &sender,
                    ConnOpen {
                        actor_id,
                        conn_id,
                        conn_token,
                        driver_kind,
                        params,
                        request,
                        reconnect,
                        transport_id,
                    },
                )
                .await;
                send_ack(&global, &sender, message_id, result).await;
            });
        }

        NodeMessageBody::LeaderConnMessage {
            actor_id,
            conn_id,
            conn_token,
            message,
        } => {
            // Reject bad tokens in the ack so the follower's caller sees them
            let checked = leader_of(global, &actor_id).and_then(|(_, instance)| {
                let conn = instance
                    .get_conn(&conn_id)
                    .ok_or_else(|| ActorError::ConnNotFound(conn_id.to_string()))?;
                conn.verify_token(&conn_token)?;
                Ok(instance)
            });
            match checked {
                Ok(instance) => {
                    send_ack(global, &sender, message_id, Ok(())).await;
                    tokio::spawn(async move {
                        if let Err(e) = instance.process_message(&conn_id, &conn_token, message).await {
                            warn!("Relayed message for conn {} failed: {}", conn_id, e);
                        }
                    });
                }
                Err(e) => send_ack(global, &sender, message_id, Err(e)).await,
            }
        }

        NodeMessageBody::LeaderConnClose {
            actor_id,
            conn_id,
            transport_ids,
        } => {
            send_ack(global, &sender, message_id, Ok(())).await;
            if let Ok((peer, instance)) = leader_of(global, &actor_id) {
                tokio::spawn(async move {
                    if let Err(e) = instance.remove_conn(&conn_id).await {
                        warn!("Failed to remove relayed conn {}: {}", conn_id, e);
                    }
                    for transport_id in transport_ids {
                        peer.release(&transport_reference(&transport_id)).await;
                    }
                });
            }
        }

        NodeMessageBody::LeaderAction {
            request_id,
            actor_id,
            action_name,
            args,
            params,
            request,
        } => match leader_of(global, &actor_id) {
            Ok((peer, instance)) if peer.retain(&request_id) => {
                send_ack(global, &sender, message_id, Ok(())).await;
                let global = global.clone();
                tokio::spawn(async move {
                    let result = execute_http_action(&instance, &action_name, args, params, request).await;
                    respond(&global, &sender, request_id.clone(), result).await;
                    peer.release(&request_id).await;
                });
            }
            Ok(_) => {
                let err = ActorError::LeaderUnavailable(actor_id.to_string());
                send_ack(global, &sender, message_id, Err(err)).await;
            }
            Err(e) => send_ack(global, &sender, message_id, Err(e)).await,
        },

        NodeMessageBody::LeaderAlarm { actor_id } => {
            let reference = format!("alarm:{}", message_id);
            match leader_of(global, &actor_id) {
                Ok((peer, instance)) if peer.retain(&reference) => {
                    send_ack(global, &sender, message_id, Ok(())).await;
                    tokio::spawn(async move {
                        if let Err(e) = instance.on_alarm().await {
                            error!("Relayed alarm for actor {} failed: {}", actor_id, e);
                        }
                        peer.release(&reference).await;
                    });
                }
                Ok(_) => {
                    let err = ActorError::LeaderUnavailable(actor_id.to_string());
                    send_ack(global, &sender, message_id, Err(err)).await;
                }
                Err(e) => send_ack(global, &sender, message_id, Err(e)).await,
            }
        }
    }
}

/// Peer and instance of an actor this node currently leads.
fn leader_of(
    global: &GlobalState,
    actor_id: &ActorId,
) -> Result<(Arc<ActorPeer>, SharedActorInstance), ActorError> {
    global
        .peer(actor_id)
        .and_then(|peer| peer.leader_instance().map(|instance| (peer, instance)))
        .ok_or_else(|| ActorError::LeaderUnavailable(actor_id.to_string()))
}

struct ConnOpen {
    actor_id: ActorId,
    conn_id: ConnId,
    conn_token: String,
    driver_kind: ConnDriverKind,
    params: Value,
    request: RequestInfo,
    reconnect: bool,
    transport_id: String,
}

async fn open_conn(global: &Arc<GlobalState>, follower: &NodeId, open: ConnOpen) -> Result<(), ActorError> {
    let (peer, instance) = leader_of(global, &open.actor_id)?;
    let reference = transport_reference(&open.transport_id);
    if !peer.retain(&reference) {
        return Err(ActorError::LeaderUnavailable(open.actor_id.to_string()));
    }

    let driver: Arc<dyn ConnDriver> = Arc::new(RelayConnDriver::new(
        global,
        open.actor_id.clone(),
        follower.clone(),
        open.driver_kind,
        open.transport_id.clone(),
    ));
    let result = if open.reconnect {
        instance
            .reconnect_conn(&open.conn_id, &open.conn_token, driver)
            .await
            .map(|_| ())
    } else {
        match instance.prepare_conn(open.params, open.request).await {
            Ok(prepared) => instance
                .create_conn(open.conn_id.clone(), open.conn_token, prepared, driver)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        }
    };

    match &result {
        Ok(()) => debug!("Conn {} opened from node {}", open.conn_id, follower),
        Err(e) => {
            debug!("Conn {} from node {} refused: {}", open.conn_id, follower, e);
            peer.release(&reference).await;
        }
    }
    result
}

async fn respond(global: &GlobalState, target: &NodeId, request_id: String, result: Result<Value, ActorError>) {
    let outcome = match result {
        Ok(output) => RelayOutcome::ok(Some(output)),
        Err(e) => RelayOutcome::err(&e),
    };
    let body = NodeMessageBody::ActionResponse {
        request_id,
        success: outcome.success,
        output: outcome.output,
        error: outcome.error,
    };
    if let Err(e) = relay::publish_to_node(global, target, body).await {
        warn!("Failed to return action response to node {}: {}", target, e);
    }
}
