#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::ServiceExt;

use troupe::actor::RawInbound;
use troupe::{
    arg, ActorDefinition, ActorError, ActorId, ActorRegistry, MemoryRuntime, RuntimeConfig,
    RuntimeContext, SharedClock, SharedTopology, StandaloneTopology, TokioClock, Topology,
};
use troupe_server::{router, TroupeServer};

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
            ctx.broadcast("count", vec![json!(count)]);
            Ok(json!(count))
        })
        .action("explode", |_ctx, _args| async move {
            Err(ActorError::user("exploded", "boom"))
        })
        .action("crash", |_ctx, _args| async move {
            Err(ActorError::internal("database password is hunter2"))
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

/// An actor with no raw WebSocket handler.
pub fn silent_definition() -> ActorDefinition<CounterState> {
    ActorDefinition::new("silent", |_input| Ok(CounterState::default()))
        .sync_action("get", |ctx, _args| ctx.state(|s| json!(s.count)))
}

pub fn registry() -> ActorRegistry {
    ActorRegistry::new()
        .with(counter_definition())
        .with(silent_definition())
}

pub fn memory_runtime() -> MemoryRuntime {
    let clock: SharedClock = Arc::new(TokioClock::new());
    RuntimeContext::memory(RuntimeConfig::default(), registry(), clock)
}

pub struct App {
    pub router: Router,
    pub standalone: Arc<StandaloneTopology>,
    pub topology: SharedTopology,
}

impl App {
    pub fn new() -> Self {
        let standalone = StandaloneTopology::new(memory_runtime().context);
        let topology: SharedTopology = standalone.clone();
        Self {
            router: router(topology.clone()),
            standalone,
            topology,
        }
    }

    pub async fn create(&self, name: &str, key: &str) -> ActorId {
        self.topology
            .get_or_create(name, &[key.to_string()], None)
            .await
            .unwrap()
            .actor_id
    }
}

pub async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Reads `data:` payloads off a server-sent events body.
pub struct SseReader {
    body: Body,
    buffer: String,
}

impl SseReader {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.read_event())
            .await
            .expect("timed out waiting for an event")
    }

    async fn read_event(&mut self) -> Value {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let data: Vec<&str> = block
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(str::trim_start)
                    .collect();
                if data.is_empty() {
                    // Keep-alive comment
                    continue;
                }
                return serde_json::from_str(&data.join("\n")).unwrap();
            }
            let frame = self
                .body
                .frame()
                .await
                .expect("event stream ended")
                .unwrap();
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(std::str::from_utf8(&data).unwrap());
            }
        }
    }
}

/// Serve `topology` on an ephemeral port. Dropping the sender stops it.
pub async fn spawn_server(topology: SharedTopology) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = TroupeServer::new(address, topology);
    tokio::spawn(async move {
        server
            .serve(listener, async move {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    (address, stop_tx)
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
