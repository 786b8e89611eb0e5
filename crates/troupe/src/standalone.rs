//! # Standalone Topology
//!
//! Every actor runs in this process. Instances are loaded lazily, at most one
//! per actor id, and stay loaded until shutdown.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::actor::conn::ConnDriver;
use crate::actor::definition::RequestInfo;
use crate::actor::instance::SharedActorInstance;
use crate::actor::protocol::ToServer;
use crate::actor::raw_websocket::{raw_websocket_pair, RawSocketTransport};
use crate::driver::AlarmTarget;
use crate::errors::ActorError;
use crate::id::{generate_conn_token, ActorId, ConnId};
use crate::runtime::RuntimeContext;
use crate::topology::{execute_http_action, ConnectedConn, Topology};

type InstanceCell = Arc<OnceCell<SharedActorInstance>>;

pub struct StandaloneTopology {
    context: RuntimeContext,
    actors: Mutex<HashMap<ActorId, InstanceCell>>,
}

impl StandaloneTopology {
    /// Create the topology and register it as the driver's alarm target.
    pub fn new(context: RuntimeContext) -> Arc<Self> {
        let topology = Arc::new(Self {
            context,
            actors: Mutex::new(HashMap::new()),
        });
        let target: Arc<dyn AlarmTarget> = topology.clone();
        topology
            .context
            .actor_driver
            .set_alarm_target(Arc::downgrade(&target));
        topology
    }

    /// Load and start the instance for `actor_id`. Concurrent callers share
    /// one instance.
    pub async fn load_actor(&self, actor_id: &ActorId) -> Result<SharedActorInstance, ActorError> {
        let cell = {
            let mut actors = self.actors.lock().unwrap_or_else(|p| p.into_inner());
            actors.entry(actor_id.clone()).or_default().clone()
        };
        let instance = match cell
            .get_or_try_init(|| self.context.create_instance(actor_id))
            .await
        {
            Ok(instance) => instance.clone(),
            Err(e) => {
                self.forget_failed_load(actor_id, &cell);
                return Err(e);
            }
        };
        instance.start().await?;
        Ok(instance)
    }

    /// Drop the cell of a load that failed, unless another caller has filled
    /// or replaced it meanwhile.
    fn forget_failed_load(&self, actor_id: &ActorId, cell: &InstanceCell) {
        let mut actors = self.actors.lock().unwrap_or_else(|p| p.into_inner());
        if actors
            .get(actor_id)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized())
        {
            actors.remove(actor_id);
        }
    }

    pub fn loaded_actor_count(&self) -> usize {
        self.actors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

#[async_trait]
impl Topology for StandaloneTopology {
    fn context(&self) -> &RuntimeContext {
        &self.context
    }

    async fn execute_action(
        &self,
        actor_id: &ActorId,
        action_name: &str,
        args: Vec<Value>,
        params: Value,
        request: RequestInfo,
    ) -> Result<Value, ActorError> {
        let instance = self.load_actor(actor_id).await?;
        execute_http_action(&instance, action_name, args, params, request).await
    }

    async fn connect(
        &self,
        actor_id: &ActorId,
        params: Value,
        request: RequestInfo,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<ConnectedConn, ActorError> {
        let instance = self.load_actor(actor_id).await?;
        let prepared = instance.prepare_conn(params, request).await?;
        let conn_id = ConnId::generate();
        let conn_token = generate_conn_token();
        instance
            .create_conn(conn_id.clone(), conn_token.clone(), prepared, driver)
            .await?;
        Ok(ConnectedConn {
            actor_id: actor_id.clone(),
            conn_id,
            conn_token,
        })
    }

    async fn reconnect(
        &self,
        actor_id: &ActorId,
        conn_id: &ConnId,
        conn_token: &str,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<ConnectedConn, ActorError> {
        let instance = self.load_actor(actor_id).await?;
        let conn = instance.reconnect_conn(conn_id, conn_token, driver).await?;
        Ok(ConnectedConn {
            actor_id: actor_id.clone(),
            conn_id: conn.id().clone(),
            conn_token: conn.token().to_string(),
        })
    }

    async fn send_message(
        &self,
        actor_id: &ActorId,
        conn_id: &ConnId,
        conn_token: &str,
        message: ToServer,
    ) -> Result<(), ActorError> {
        let instance = self.load_actor(actor_id).await?;
        instance.process_message(conn_id, conn_token, message).await
    }

    async fn disconnect(&self, actor_id: &ActorId, conn_id: &ConnId) -> Result<(), ActorError> {
        let instance = self.load_actor(actor_id).await?;
        instance.remove_conn(conn_id).await
    }

    async fn open_raw_websocket(
        &self,
        actor_id: &ActorId,
        url: String,
        headers: HashMap<String, String>,
    ) -> Result<RawSocketTransport, ActorError> {
        let instance = self.load_actor(actor_id).await?;
        let (socket, transport) = raw_websocket_pair(url, headers);
        instance.handle_raw_websocket(socket).await?;
        Ok(transport)
    }

    async fn shutdown(&self) {
        let instances: Vec<SharedActorInstance> = {
            let mut actors = self.actors.lock().unwrap_or_else(|p| p.into_inner());
            actors
                .drain()
                .filter_map(|(_, cell)| cell.get().cloned())
                .collect()
        };
        info!("Stopping {} actors", instances.len());
        for instance in instances {
            if let Err(e) = instance.stop().await {
                error!("Failed to stop actor {}: {}", instance.actor_id(), e);
            }
        }
    }
}

#[async_trait]
impl AlarmTarget for StandaloneTopology {
    async fn on_alarm(&self, actor_id: &ActorId) {
        debug!("Alarm for actor {}", actor_id);
        let instance = match self.load_actor(actor_id).await {
            Ok(instance) => instance,
            Err(e) => {
                error!("Failed to load actor {} for alarm: {}", actor_id, e);
                return;
            }
        };
        if let Err(e) = instance.on_alarm().await {
            error!("Alarm for actor {} failed: {}", actor_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RuntimeConfig;
    use crate::registry::ActorRegistry;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn unknown_actors_leave_nothing_behind() {
        let runtime = RuntimeContext::memory(
            RuntimeConfig::default(),
            ActorRegistry::new(),
            Arc::new(ManualClock::new(0)),
        );
        let topology = StandaloneTopology::new(runtime.context);

        for i in 0..3 {
            let err = topology
                .load_actor(&ActorId::new(format!("ghost-{}", i)))
                .await
                .err()
                .expect("expected load_actor to fail");
            assert_eq!(err.code(), "actor_not_found");
        }
        assert_eq!(topology.actors.lock().unwrap().len(), 0);
        assert_eq!(topology.loaded_actor_count(), 0);
    }
}
