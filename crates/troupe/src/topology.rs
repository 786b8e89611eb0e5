//! The surface the router layer talks to. A topology decides where an
//! actor runs: in this process (standalone) or on whichever node holds its
//! lease (coordinate).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::error;

use crate::actor::conn::{ConnDriver, HttpConnDriver};
use crate::actor::definition::RequestInfo;
use crate::actor::instance::SharedActorInstance;
use crate::actor::protocol::ToServer;
use crate::actor::raw_websocket::RawSocketTransport;
use crate::errors::ActorError;
use crate::id::{generate_conn_token, ActorId, ConnId};
use crate::manager::{get_or_create_actor, ActorRecord};
use crate::runtime::RuntimeContext;

/// Identity handed back to a client after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedConn {
    pub actor_id: ActorId,
    pub conn_id: ConnId,
    pub conn_token: String,
}

#[async_trait]
pub trait Topology: Send + Sync + 'static {
    fn context(&self) -> &RuntimeContext;

    /// Resolve an actor by name and key, creating it on first use.
    async fn get_or_create(
        &self,
        name: &str,
        key: &[String],
        input: Option<Value>,
    ) -> Result<ActorRecord, ActorError> {
        if self.context().registry.get(name).is_none() {
            return Err(ActorError::ActorNotFound(name.to_string()));
        }
        Ok(get_or_create_actor(self.context().manager_driver.as_ref(), name, key, input).await?)
    }

    /// One-shot action call over a temporary HTTP connection.
    async fn execute_action(
        &self,
        actor_id: &ActorId,
        action_name: &str,
        args: Vec<Value>,
        params: Value,
        request: RequestInfo,
    ) -> Result<Value, ActorError>;

    /// Open a connection whose messages are pushed through `driver`.
    async fn connect(
        &self,
        actor_id: &ActorId,
        params: Value,
        request: RequestInfo,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<ConnectedConn, ActorError>;

    /// Reattach a transport to an existing connection.
    async fn reconnect(
        &self,
        actor_id: &ActorId,
        conn_id: &ConnId,
        conn_token: &str,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<ConnectedConn, ActorError>;

    /// Deliver a client message to a connection. The token must match.
    async fn send_message(
        &self,
        actor_id: &ActorId,
        conn_id: &ConnId,
        conn_token: &str,
        message: ToServer,
    ) -> Result<(), ActorError>;

    /// The transport of a connection closed.
    async fn disconnect(&self, actor_id: &ActorId, conn_id: &ConnId) -> Result<(), ActorError>;

    /// Hand a raw WebSocket to the actor. The returned transport is bridged
    /// to the physical socket by the caller.
    async fn open_raw_websocket(
        &self,
        actor_id: &ActorId,
        url: String,
        headers: HashMap<String, String>,
    ) -> Result<RawSocketTransport, ActorError>;

    /// Stop every actor this process runs.
    async fn shutdown(&self);
}

pub type SharedTopology = Arc<dyn Topology>;

/// Run one action on a loaded instance over a temporary HTTP connection.
///
/// The connection goes through the usual connect hooks and is removed again
/// whether or not the action succeeds.
pub async fn execute_http_action(
    instance: &SharedActorInstance,
    action_name: &str,
    args: Vec<Value>,
    params: Value,
    request: RequestInfo,
) -> Result<Value, ActorError> {
    let prepared = instance.prepare_conn(params, request).await?;
    let conn_id = ConnId::generate();
    let conn = instance
        .create_conn(
            conn_id.clone(),
            generate_conn_token(),
            prepared,
            Arc::new(HttpConnDriver),
        )
        .await?;

    let result = instance.execute_action(Some(conn), action_name, args).await;
    if let Err(e) = instance.remove_conn(&conn_id).await {
        error!("Failed to remove HTTP conn {}: {}", conn_id, e);
    }
    result
}
