//! Actors served by the binary out of the box.

use serde::{Deserialize, Serialize};
use serde_json::json;

use troupe::actor::RawInbound;
use troupe::{arg, ActorDefinition, ActorRegistry};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub count: i64,
}

/// A counter that broadcasts every change to its connections and echoes
/// raw WebSocket frames.
pub fn counter() -> ActorDefinition<CounterState> {
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

pub fn registry() -> ActorRegistry {
    ActorRegistry::new().with(counter())
}
