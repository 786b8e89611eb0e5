//! # Coordinate Topology
//!
//! Runs actors across many nodes sharing one coordinate driver. Each call
//! acquires the actor's peer under a reference named after the conn, socket
//! or request it serves. If this node leads the actor the call runs locally,
//! otherwise it is relayed to the leader.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use troupe::actor::{raw_websocket_pair_with_id, RawSocketTransport};
use troupe::id::{generate_conn_token, generate_message_id};
use troupe::{
    execute_http_action, ActorError, ActorId, AlarmTarget, ConnDriver, ConnId, ConnectedConn,
    NodeId, RequestInfo, RuntimeContext, ToServer, Topology,
};

use crate::driver::SharedCoordinateDriver;
use crate::global_state::{lock, GlobalState};
use crate::node::spawn_message_loop;
use crate::peer::ActorPeer;
use crate::protocol::NodeMessageBody;
use crate::raw_websocket::open_follower_socket;
use crate::relay::{publish_to_leader, relay_action};
use crate::relay_conn::open_relayed_conn;

pub struct CoordinateTopology {
    global: Arc<GlobalState>,
    message_loop: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinateTopology {
    /// Join the cluster under the configured node id, or a generated one.
    pub async fn start(
        context: RuntimeContext,
        coordinate: SharedCoordinateDriver,
    ) -> Result<Arc<Self>, ActorError> {
        let node_id = context
            .config
            .node_id
            .clone()
            .map(NodeId::new)
            .unwrap_or_else(NodeId::generate);
        Self::start_with_node_id(context, coordinate, node_id).await
    }

    pub async fn start_with_node_id(
        context: RuntimeContext,
        coordinate: SharedCoordinateDriver,
        node_id: NodeId,
    ) -> Result<Arc<Self>, ActorError> {
        let rx = coordinate.subscribe(&node_id).await?;
        let global = Arc::new(GlobalState::new(node_id.clone(), context, coordinate));
        let message_loop = spawn_message_loop(global.clone(), rx);

        let topology = Arc::new(Self {
            global,
            message_loop: Mutex::new(Some(message_loop)),
        });
        let target: Arc<dyn AlarmTarget> = topology.clone();
        topology
            .global
            .runtime
            .actor_driver
            .set_alarm_target(Arc::downgrade(&target));

        info!("Node {} joined", node_id);
        Ok(topology)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.global.node_id
    }

    pub fn global(&self) -> &Arc<GlobalState> {
        &self.global
    }

    /// Hold `reference` on the actor's peer, electing a leader if needed.
    pub async fn acquire_actor(
        &self,
        actor_id: &ActorId,
        reference: &str,
    ) -> Result<Arc<ActorPeer>, ActorError> {
        ActorPeer::acquire(&self.global, actor_id, reference).await
    }

    pub async fn release_actor(&self, actor_id: &ActorId, reference: &str) {
        if let Some(peer) = self.global.peer(actor_id) {
            peer.release(reference).await;
        }
    }

    async fn connect_with(
        &self,
        actor_id: &ActorId,
        conn_id: ConnId,
        conn_token: String,
        driver: Arc<dyn ConnDriver>,
        open: ConnOpen,
    ) -> Result<ConnectedConn, ActorError> {
        let reference = conn_id.to_string();
        let peer = self.acquire_actor(actor_id, &reference).await?;

        let result = match peer.leader_instance() {
            Some(instance) => match open {
                ConnOpen::Fresh { params, request } => {
                    match instance.prepare_conn(params, request).await {
                        Ok(prepared) => instance
                            .create_conn(conn_id.clone(), conn_token.clone(), prepared, driver)
                            .await
                            .map(|_| ()),
                        Err(e) => Err(e),
                    }
                }
                ConnOpen::Reconnect => instance
                    .reconnect_conn(&conn_id, &conn_token, driver)
                    .await
                    .map(|_| ()),
            },
            None => {
                let (params, request, reconnect) = match open {
                    ConnOpen::Fresh { params, request } => (params, request, false),
                    ConnOpen::Reconnect => (Value::Null, RequestInfo::default(), true),
                };
                open_relayed_conn(
                    &self.global,
                    actor_id,
                    &conn_id,
                    &conn_token,
                    driver,
                    params,
                    request,
                    reconnect,
                )
                .await
            }
        };

        match result {
            Ok(()) => Ok(ConnectedConn {
                actor_id: actor_id.clone(),
                conn_id,
                conn_token,
            }),
            Err(e) => {
                peer.release(&reference).await;
                Err(e)
            }
        }
    }
}

enum ConnOpen {
    Fresh { params: Value, request: RequestInfo },
    Reconnect,
}

#[async_trait]
impl Topology for CoordinateTopology {
    fn context(&self) -> &RuntimeContext {
        &self.global.runtime
    }

    async fn execute_action(
        &self,
        actor_id: &ActorId,
        action_name: &str,
        args: Vec<Value>,
        params: Value,
        request: RequestInfo,
    ) -> Result<Value, ActorError> {
        let reference = format!("request:{}", generate_message_id());
        let peer = self.acquire_actor(actor_id, &reference).await?;

        let result = match peer.leader_instance() {
            Some(instance) => execute_http_action(&instance, action_name, args, params, request).await,
            None => relay_action(&self.global, actor_id, action_name, args, params, request, None).await,
        };
        peer.release(&reference).await;
        result
    }

    async fn connect(
        &self,
        actor_id: &ActorId,
        params: Value,
        request: RequestInfo,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<ConnectedConn, ActorError> {
        self.connect_with(
            actor_id,
            ConnId::generate(),
            generate_conn_token(),
            driver,
            ConnOpen::Fresh { params, request },
        )
        .await
    }

    async fn reconnect(
        &self,
        actor_id: &ActorId,
        conn_id: &ConnId,
        conn_token: &str,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<ConnectedConn, ActorError> {
        self.connect_with(
            actor_id,
            conn_id.clone(),
            conn_token.to_string(),
            driver,
            ConnOpen::Reconnect,
        )
        .await
    }

    async fn send_message(
        &self,
        actor_id: &ActorId,
        conn_id: &ConnId,
        conn_token: &str,
        message: ToServer,
    ) -> Result<(), ActorError> {
        let reference = format!("message:{}", generate_message_id());
        let peer = self.acquire_actor(actor_id, &reference).await?;

        let result = match peer.leader_instance() {
            Some(instance) => instance.process_message(conn_id, conn_token, message).await,
            None => {
                let body = NodeMessageBody::LeaderConnMessage {
                    actor_id: actor_id.clone(),
                    conn_id: conn_id.clone(),
                    conn_token: conn_token.to_string(),
                    message,
                };
                publish_to_leader(&self.global, actor_id, body, None)
                    .await
                    .map(|_| ())
            }
        };
        peer.release(&reference).await;
        result
    }

    async fn disconnect(&self, actor_id: &ActorId, conn_id: &ConnId) -> Result<(), ActorError> {
        let transports = self.global.remove_relayed_transports(conn_id);
        let result = if !transports.is_empty() {
            let body = NodeMessageBody::LeaderConnClose {
                actor_id: actor_id.clone(),
                conn_id: conn_id.clone(),
                transport_ids: transports.into_iter().map(|(id, _)| id).collect(),
            };
            publish_to_leader(&self.global, actor_id, body, None)
                .await
                .map(|_| ())
        } else {
            match self.global.peer(actor_id).and_then(|peer| peer.leader_instance()) {
                Some(instance) => instance.remove_conn(conn_id).await,
                None => {
                    debug!("Conn {} of actor {} is not on this node", conn_id, actor_id);
                    Ok(())
                }
            }
        };
        self.release_actor(actor_id, &conn_id.to_string()).await;
        result
    }

    async fn open_raw_websocket(
        &self,
        actor_id: &ActorId,
        url: String,
        headers: HashMap<String, String>,
    ) -> Result<RawSocketTransport, ActorError> {
        let websocket_id = generate_message_id();
        let peer = self.acquire_actor(actor_id, &websocket_id).await?;

        let result = match peer.leader_instance() {
            Some(instance) => {
                let (socket, transport) = raw_websocket_pair_with_id(websocket_id.clone(), url, headers);
                let watch = transport.inbound.clone();
                match instance.handle_raw_websocket(socket).await {
                    Ok(()) => {
                        // Released once the actor drops its end
                        let peer = peer.clone();
                        let reference = websocket_id.clone();
                        tokio::spawn(async move {
                            watch.closed().await;
                            peer.release(&reference).await;
                        });
                        Ok(transport)
                    }
                    Err(e) => Err(e),
                }
            }
            None => open_follower_socket(&self.global, actor_id, websocket_id.clone(), url, headers).await,
        };

        if result.is_err() {
            peer.release(&websocket_id).await;
        }
        result
    }

    async fn shutdown(&self) {
        let peers: Vec<Arc<ActorPeer>> = {
            let peers = lock(&self.global.peers);
            peers.values().cloned().collect()
        };
        info!("Node {} disposing {} actor peers", self.global.node_id, peers.len());
        for peer in peers {
            peer.dispose().await;
        }

        self.global.shutdown.cancel();
        let message_loop = lock(&self.message_loop).take();
        if let Some(message_loop) = message_loop {
            if let Err(e) = message_loop.await {
                warn!("Message loop of node {} panicked: {}", self.global.node_id, e);
            }
        }
    }
}

#[async_trait]
impl AlarmTarget for CoordinateTopology {
    async fn on_alarm(&self, actor_id: &ActorId) {
        let reference = format!("alarm:{}", generate_message_id());
        let peer = match self.acquire_actor(actor_id, &reference).await {
            Ok(peer) => peer,
            Err(e) => {
                error!("Failed to acquire actor {} for alarm: {}", actor_id, e);
                return;
            }
        };

        match peer.leader_instance() {
            Some(instance) => {
                if let Err(e) = instance.on_alarm().await {
                    error!("Alarm for actor {} failed: {}", actor_id, e);
                }
            }
            None => {
                debug!("Forwarding alarm for actor {} to its leader", actor_id);
                let body = NodeMessageBody::LeaderAlarm {
                    actor_id: actor_id.clone(),
                };
                if let Err(e) = publish_to_leader(&self.global, actor_id, body, None).await {
                    error!("Failed to forward alarm for actor {}: {}", actor_id, e);
                }
            }
        }
        peer.release(&reference).await;
    }
}
