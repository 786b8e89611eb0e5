#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use troupe::actor::{ConnFrame, RawInbound};
use troupe::manager::get_or_create_actor;
use troupe::{
    arg, ActorDefinition, ActorError, ActorId, ActorRegistry, MemoryRuntime, NodeId, RuntimeConfig,
    RuntimeContext, SharedClock, ToClient, TokioClock,
};
use troupe_coordinate::{CoordinateTopology, MemoryCoordinateDriver};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub count: i64,
}

pub fn counter_definition() -> ActorDefinition<CounterState> {
    ActorDefinition::new("counter", |_input| Ok(CounterState::default()))
        .sync_action("get", |ctx, _args| ctx.state(|s| json!(s.count)))
        .action("increment", |ctx, args| async move {
            let by: i64 = arg(&args, 0)?;
            let count = ctx.mutate_state(|s| {
                s.count += by;
                s.count
            })?;
            Ok(json!(count))
        })
        .on_raw_websocket(|_ctx, socket| async move {
            let (sender, mut inbound) = socket.split();
            tokio::spawn(async move {
                while let Some(RawInbound::Frame(frame)) = inbound.recv().await {
                    sender.send(frame);
                }
            });
            Ok(())
        })
}

/// Counts connect attempts in its state, then refuses every conn.
pub fn flaky_definition() -> ActorDefinition<CounterState> {
    ActorDefinition::new("flaky", |_input| Ok(CounterState::default())).on_connect(|ctx, _conn| async move {
        ctx.mutate_state(|s| s.count += 1)?;
        Err(ActorError::internal("db down"))
    })
}

/// Nodes sharing one storage backend and one coordinate driver, on tokio's
/// clock so leases expire as paused time advances.
pub struct Cluster {
    pub runtime: MemoryRuntime,
    pub coordinate: Arc<MemoryCoordinateDriver>,
}

impl Cluster {
    pub fn new() -> Self {
        let clock: SharedClock = Arc::new(TokioClock::new());
        let registry = ActorRegistry::new()
            .with(counter_definition())
            .with(flaky_definition());
        Self {
            runtime: RuntimeContext::memory(RuntimeConfig::default(), registry, clock.clone()),
            coordinate: Arc::new(MemoryCoordinateDriver::new(clock)),
        }
    }

    pub async fn node(&self, name: &str) -> Arc<CoordinateTopology> {
        CoordinateTopology::start_with_node_id(
            self.runtime.context.clone(),
            self.coordinate.clone(),
            NodeId::new(name),
        )
        .await
        .unwrap()
    }

    pub async fn counter(&self, key: &str) -> ActorId {
        self.create("counter", key).await
    }

    pub async fn create(&self, name: &str, key: &str) -> ActorId {
        get_or_create_actor(
            self.runtime.context.manager_driver.as_ref(),
            name,
            &[key.to_string()],
            None,
        )
        .await
        .unwrap()
        .actor_id
    }

    pub fn persisted_count(&self, actor_id: &ActorId) -> i64 {
        let persisted = self.runtime.actor_driver.persisted_json(actor_id).unwrap();
        persisted["state"]["count"].as_i64().unwrap()
    }
}

/// Next pushed frame within `timeout`.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<ConnFrame>, timeout: Duration) -> ConnFrame {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("conn channel closed")
}

pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<ConnFrame>) -> ToClient {
    match next_frame(rx, Duration::from_secs(1)).await {
        ConnFrame::Message(json) => serde_json::from_str(&json).unwrap(),
        ConnFrame::Close { reason, ack } => {
            let _ = ack.send(());
            panic!("conn closed while waiting for a message: {:?}", reason);
        }
    }
}
