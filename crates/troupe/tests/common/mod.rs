#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use troupe::actor::{ConnFrame, PreparedConn, PushConnDriver};
use troupe::manager::get_or_create_actor;
use troupe::{
    arg, ActorDefinition, ActorError, ActorId, ActorRegistry, ConnId, ManualClock, MemoryRuntime,
    RuntimeConfig, RuntimeContext, SharedActorInstance, SharedClock, ToClient,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub count: i64,
    pub log: Vec<String>,
}

/// Counter used across the integration tests.
pub fn counter_definition() -> ActorDefinition<CounterState> {
    ActorDefinition::new("counter", |input| {
        let start = input
            .and_then(|v| v.get("start"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(CounterState {
            count: start,
            log: Vec::new(),
        })
    })
    .sync_action("get", |ctx, _args| ctx.state(|s| json!(s.count)))
    .sync_action("log", |ctx, _args| ctx.state(|s| json!(s.log)))
    .action("increment", |ctx, args| async move {
        let by: i64 = arg(&args, 0)?;
        let count = ctx.mutate_state(|s| {
            s.count += by;
            s.count
        })?;
        ctx.broadcast("count", vec![json!(count)]);
        Ok(json!(count))
    })
    .action("record", |ctx, args| async move {
        let label: String = arg(&args, 0)?;
        ctx.mutate_state(|s| s.log.push(label))?;
        Ok(Value::Null)
    })
    .action("explode", |ctx, _args| async move {
        ctx.mutate_state(|s| s.log.push("exploding".to_string()))?;
        Err(ActorError::user("exploded", "boom"))
    })
    .action("crash", |_ctx, _args| async move {
        Err(ActorError::internal("database password is hunter2"))
    })
    .action("schedule", |ctx, args| async move {
        let delay: i64 = arg(&args, 0)?;
        let fn_name: String = arg(&args, 1)?;
        let rest: Vec<Value> = args.into_iter().skip(2).collect();
        let event_id = ctx.schedule().after(delay, &fn_name, rest).await?;
        Ok(json!(event_id))
    })
}

pub fn memory_runtime(registry: ActorRegistry, clock: SharedClock) -> MemoryRuntime {
    RuntimeContext::memory(RuntimeConfig::default(), registry, clock)
}

pub fn counter_runtime() -> (MemoryRuntime, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let runtime = memory_runtime(ActorRegistry::new().with(counter_definition()), clock.clone());
    (runtime, clock)
}

pub async fn create_actor(context: &RuntimeContext, name: &str, key: &str) -> ActorId {
    get_or_create_actor(
        context.manager_driver.as_ref(),
        name,
        &[key.to_string()],
        None,
    )
    .await
    .unwrap()
    .actor_id
}

pub async fn started_instance(context: &RuntimeContext, actor_id: &ActorId) -> SharedActorInstance {
    let instance = context.create_instance(actor_id).await.unwrap();
    instance.start().await.unwrap();
    instance
}

pub fn prepared(params: Value) -> PreparedConn {
    PreparedConn {
        params,
        auth: None,
        state: Value::Null,
    }
}

/// Open a WebSocket-like connection on the instance and consume its `Init`.
pub async fn open_conn(
    instance: &SharedActorInstance,
) -> (ConnId, String, mpsc::UnboundedReceiver<ConnFrame>) {
    let (driver, mut rx) = PushConnDriver::websocket();
    let conn_id = ConnId::generate();
    let token = troupe::id::generate_conn_token();
    let prepared = instance
        .prepare_conn(json!({}), Default::default())
        .await
        .unwrap();
    instance
        .create_conn(conn_id.clone(), token.clone(), prepared, Arc::new(driver))
        .await
        .unwrap();
    match next_message(&mut rx).await {
        ToClient::Init { conn_id: id, .. } => assert_eq!(id, conn_id),
        other => panic!("expected init, got {:?}", other),
    }
    (conn_id, token, rx)
}

/// Next pushed message, failing the test after a second.
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<ConnFrame>) -> ToClient {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("conn channel closed");
        match frame {
            ConnFrame::Message(json) => return serde_json::from_str(&json).unwrap(),
            ConnFrame::Close { ack, .. } => {
                let _ = ack.send(());
                panic!("conn closed while waiting for a message");
            }
        }
    }
}
