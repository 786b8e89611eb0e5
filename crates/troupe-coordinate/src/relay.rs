//! # Relay
//!
//! Publishing messages to other nodes and waiting for their acknowledgement.
//!
//! Messages for an actor's leader are retried with backoff while leadership
//! is in flux: no leader on record, an expired lease, or a leader that died
//! before acknowledging. An error the leader sends back in its ack is the
//! outcome of the call and is returned as is; only a leader that no longer
//! leads the actor is worth another attempt. Every waiter is registered
//! behind a guard, so no pending entry outlives its caller on success,
//! timeout or abort.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use troupe::id::generate_message_id;
use troupe::{ActorError, ActorId, NodeId, RequestInfo};

use crate::global_state::{GlobalState, RelayOutcome};
use crate::protocol::{NodeMessage, NodeMessageBody};

/// Fire and forget.
pub async fn publish_to_node(
    global: &GlobalState,
    target: &NodeId,
    body: NodeMessageBody,
) -> Result<(), ActorError> {
    let message = NodeMessage {
        sender_node_id: global.node_id.clone(),
        message_id: generate_message_id(),
        body,
    };
    send(global, target, &message).await
}

/// Why one delivery attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// The receiver handled the message and answered with this error
    Remote(ActorError),
    /// No answer: no leader on record, the publish failed or the ack never came
    Local(ActorError),
}

impl AttemptError {
    pub fn into_inner(self) -> ActorError {
        match self {
            Self::Remote(e) | Self::Local(e) => e,
        }
    }

    /// Failures that leadership handoff can resolve on its own. The hooks
    /// behind a remote error already ran, so those are only retried when the
    /// receiver was not the leader.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => matches!(e, ActorError::LeaderUnavailable(_)),
            Self::Local(e) => !matches!(e, ActorError::Aborted),
        }
    }
}

/// Publish and wait for the receiver's ack.
pub async fn publish_to_node_with_ack(
    global: &GlobalState,
    target: &NodeId,
    body: NodeMessageBody,
    timeout: Duration,
) -> Result<Option<Value>, ActorError> {
    attempt_with_ack(global, target, body, timeout)
        .await
        .map_err(AttemptError::into_inner)
}

async fn attempt_with_ack(
    global: &GlobalState,
    target: &NodeId,
    body: NodeMessageBody,
    timeout: Duration,
) -> Result<Option<Value>, AttemptError> {
    let message = NodeMessage {
        sender_node_id: global.node_id.clone(),
        message_id: generate_message_id(),
        body,
    };
    let (_guard, ack) = global.register_ack(&message.message_id);
    send(global, target, &message).await.map_err(AttemptError::Local)?;

    match tokio::time::timeout(timeout, ack).await {
        Ok(Ok(outcome)) => outcome.into_result().map_err(AttemptError::Remote),
        Ok(Err(_)) => Err(AttemptError::Local(ActorError::internal("ack channel closed"))),
        Err(_) => {
            debug!(
                "No ack from node {} for {} within {:?}",
                target,
                message.body.kind(),
                timeout
            );
            Err(AttemptError::Local(ActorError::RelayTimedOut))
        }
    }
}

/// Publish to the actor's leader, retrying transient failures.
pub async fn publish_to_leader(
    global: &GlobalState,
    actor_id: &ActorId,
    body: NodeMessageBody,
    abort: Option<&CancellationToken>,
) -> Result<Option<Value>, ActorError> {
    let retry = &global.runtime.config.relay;
    let ack_timeout = ack_timeout_for(global, &body);
    let mut attempt = 0;
    loop {
        let result = abortable(abort, async {
            let leader = match current_leader(global, actor_id).await {
                Ok(leader) => leader,
                Err(e) => return Ok(Err(AttemptError::Local(e))),
            };
            Ok(attempt_with_ack(global, &leader, body.clone(), ack_timeout).await)
        })
        .await?;

        match result {
            Ok(output) => return Ok(output),
            Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    "Relay of {} to leader of actor {} failed (attempt {}/{}): {}, retrying in {:?}",
                    body.kind(),
                    actor_id,
                    attempt + 1,
                    retry.max_attempts,
                    e.clone().into_inner(),
                    delay
                );
                abortable(abort, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
                attempt += 1;
            }
            Err(e) => return Err(e.into_inner()),
        }
    }
}

/// Publish to the leader once, without waiting for an ack. Used for raw
/// WebSocket frames, where a lost frame is preferable to a stalled socket.
pub async fn publish_to_leader_no_retry(
    global: &GlobalState,
    actor_id: &ActorId,
    body: NodeMessageBody,
) -> Result<(), ActorError> {
    let leader = current_leader(global, actor_id).await?;
    publish_to_node(global, &leader, body)
        .await
        .map_err(|e| ActorError::LeaderUnavailable(format!("{}: {}", actor_id, e)))
}

/// Run an action on the actor's leader and wait for its response.
pub async fn relay_action(
    global: &GlobalState,
    actor_id: &ActorId,
    action_name: &str,
    args: Vec<Value>,
    params: Value,
    request: RequestInfo,
    abort: Option<&CancellationToken>,
) -> Result<Value, ActorError> {
    let request_id = generate_message_id();
    let (_guard, response) = global.register_response(&request_id);

    let body = NodeMessageBody::LeaderAction {
        request_id: request_id.clone(),
        actor_id: actor_id.clone(),
        action_name: action_name.to_string(),
        args,
        params,
        request,
    };
    publish_to_leader(global, actor_id, body, abort).await?;

    let timeout = global.runtime.config.actor_peer.message_ack_timeout()
        * global.runtime.config.relay.action_response_timeout_factor;
    let outcome = abortable(abort, async {
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ActorError::internal("response channel closed")),
            Err(_) => Err(ActorError::RelayTimedOut),
        }
    })
    .await?;

    trace!("Relayed action {} on actor {} resolved", action_name, actor_id);
    outcome.into_result().map(|output| output.unwrap_or(Value::Null))
}

/// Node currently holding an unexpired lease on the actor.
pub async fn current_leader(global: &GlobalState, actor_id: &ActorId) -> Result<NodeId, ActorError> {
    let now = global.runtime.clock.now_ms();
    match global.coordinate.get_actor_leader(actor_id).await? {
        Some(lease) if !lease.is_expired(now) => Ok(lease.leader_node_id),
        _ => Err(ActorError::LeaderUnavailable(actor_id.to_string())),
    }
}

/// Opening a conn or a raw socket runs user hooks on the leader before it
/// acks, so those wait as long as a relayed action.
fn ack_timeout_for(global: &GlobalState, body: &NodeMessageBody) -> Duration {
    let ack_timeout = global.runtime.config.actor_peer.message_ack_timeout();
    match body {
        NodeMessageBody::LeaderConnOpen { .. } | NodeMessageBody::LeaderWebSocketOpen { .. } => {
            ack_timeout * global.runtime.config.relay.action_response_timeout_factor
        }
        _ => ack_timeout,
    }
}

async fn send(global: &GlobalState, target: &NodeId, message: &NodeMessage) -> Result<(), ActorError> {
    let payload = message.encode()?;
    trace!("Publishing {} to node {}", message.body.kind(), target);
    global
        .coordinate
        .publish_to_node(&global.node_id, target, payload)
        .await?;
    Ok(())
}

async fn abortable<T>(
    abort: Option<&CancellationToken>,
    future: impl Future<Output = Result<T, ActorError>>,
) -> Result<T, ActorError> {
    match abort {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ActorError::Aborted),
            result = future => result,
        },
        None => future.await,
    }
}

/// Reply to a message that expects an ack.
pub async fn send_ack(
    global: &GlobalState,
    target: &NodeId,
    message_id: String,
    result: Result<(), ActorError>,
) {
    let outcome = match &result {
        Ok(()) => RelayOutcome::ok(None),
        Err(e) => RelayOutcome::err(e),
    };
    let body = NodeMessageBody::Ack {
        message_id,
        success: outcome.success,
        error: outcome.error,
    };
    if let Err(e) = publish_to_node(global, target, body).await {
        debug!("Failed to ack node {}: {}", target, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_handoff_failures_are_retried() {
        assert!(AttemptError::Local(ActorError::RelayTimedOut).is_retryable());
        assert!(AttemptError::Local(ActorError::LeaderUnavailable("a".to_string())).is_retryable());
        assert!(AttemptError::Local(ActorError::internal("redis down")).is_retryable());
        assert!(AttemptError::Remote(ActorError::LeaderUnavailable("a".to_string())).is_retryable());
        assert!(!AttemptError::Local(ActorError::Aborted).is_retryable());
    }

    #[test]
    fn errors_from_the_leader_are_final() {
        assert!(!AttemptError::Remote(ActorError::internal("db down")).is_retryable());
        assert!(!AttemptError::Remote(ActorError::RelayTimedOut).is_retryable());
        assert!(!AttemptError::Remote(ActorError::IncorrectConnToken).is_retryable());
        assert!(!AttemptError::Remote(ActorError::user("full", "room is full")).is_retryable());
    }
}
