//! # Actor Definition
//!
//! Everything the runtime needs to know to run one kind of actor: how to
//! build its state and vars, its lifecycle hooks, and the table of actions
//! clients and the scheduler may call by name.
//!
//! ```ignore
//! let counter = ActorDefinition::new("counter", |_input| Ok(Counter { count: 0 }))
//!     .sync_action("get", |ctx, _args| ctx.state(|s| json!(s.count)))
//!     .action("increment", |ctx, args| async move {
//!         let by: i64 = arg(&args, 0)?;
//!         let count = ctx.mutate_state(|s| {
//!             s.count += by;
//!             s.count
//!         })?;
//!         ctx.broadcast("count", vec![json!(count)]);
//!         Ok(json!(count))
//!     });
//! ```

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::actor::conn::Conn;
use crate::actor::context::ActionContext;
use crate::actor::raw_websocket::RawWebSocket;
use crate::config::ActorOptions;
use crate::driver::DriverContext;
use crate::errors::ActorError;

/// Bounds for persisted actor state.
pub trait ActorState: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> ActorState for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bounds for ephemeral actor vars.
pub trait ActorVars: Send + Sync + 'static {}
impl<T> ActorVars for T where T: Send + Sync + 'static {}

/// Transport level details of the request that opened a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Input to the connect hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectRequest {
    pub params: Value,
    pub request: RequestInfo,
}

type HookResult<T> = BoxFuture<'static, Result<T, ActorError>>;

pub(crate) type CreateStateFn<S> = Arc<dyn Fn(Option<&Value>) -> Result<S, ActorError> + Send + Sync>;
pub(crate) type CreateVarsFn<V> = Arc<dyn Fn(Option<DriverContext>) -> V + Send + Sync>;
pub(crate) type LifecycleHook<S, V> = Arc<dyn Fn(ActionContext<S, V>) -> HookResult<()> + Send + Sync>;
pub(crate) type CreateHook<S, V> =
    Arc<dyn Fn(ActionContext<S, V>, Option<Value>) -> HookResult<()> + Send + Sync>;
pub(crate) type ConnectHook<S, V, T> =
    Arc<dyn Fn(ActionContext<S, V>, ConnectRequest) -> HookResult<T> + Send + Sync>;
pub(crate) type ConnHook<S, V> = Arc<dyn Fn(ActionContext<S, V>, Arc<Conn>) -> HookResult<()> + Send + Sync>;
pub(crate) type BeforeResponseHook<S, V> =
    Arc<dyn Fn(ActionContext<S, V>, String, Vec<Value>, Value) -> HookResult<Value> + Send + Sync>;
pub(crate) type RawWebSocketHook<S, V> =
    Arc<dyn Fn(ActionContext<S, V>, RawWebSocket) -> HookResult<()> + Send + Sync>;

/// An entry of the action table.
pub enum ActionHandler<S, V> {
    /// Runs to completion inline. Not subject to the action timeout.
    Sync(Arc<dyn Fn(&ActionContext<S, V>, Vec<Value>) -> Result<Value, ActorError> + Send + Sync>),
    /// Awaited under the action timeout.
    Async(Arc<dyn Fn(ActionContext<S, V>, Vec<Value>) -> HookResult<Value> + Send + Sync>),
}

impl<S, V> Clone for ActionHandler<S, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(f.clone()),
            Self::Async(f) => Self::Async(f.clone()),
        }
    }
}

pub struct ActorDefinition<S, V = ()> {
    pub(crate) name: String,
    pub(crate) create_state: CreateStateFn<S>,
    pub(crate) create_vars: CreateVarsFn<V>,
    pub(crate) on_create: Option<CreateHook<S, V>>,
    pub(crate) on_start: Option<LifecycleHook<S, V>>,
    pub(crate) on_stop: Option<LifecycleHook<S, V>>,
    pub(crate) on_before_connect: Option<ConnectHook<S, V, ()>>,
    pub(crate) on_auth: Option<ConnectHook<S, V, Value>>,
    pub(crate) create_conn_state: Option<ConnectHook<S, V, Value>>,
    pub(crate) on_connect: Option<ConnHook<S, V>>,
    pub(crate) on_disconnect: Option<ConnHook<S, V>>,
    pub(crate) on_before_action_response: Option<BeforeResponseHook<S, V>>,
    pub(crate) on_raw_websocket: Option<RawWebSocketHook<S, V>>,
    pub(crate) actions: HashMap<String, ActionHandler<S, V>>,
    pub(crate) options: Option<ActorOptions>,
}

impl<S: ActorState> ActorDefinition<S, ()> {
    /// Define an actor without vars.
    pub fn new<F>(name: impl Into<String>, create_state: F) -> Self
    where
        F: Fn(Option<&Value>) -> Result<S, ActorError> + Send + Sync + 'static,
    {
        Self::with_vars(name, create_state, |_| ())
    }
}

impl<S: ActorState, V: ActorVars> ActorDefinition<S, V> {
    /// Define an actor whose vars are built by `create_vars` on every start.
    /// Vars are never persisted.
    pub fn with_vars<F, G>(name: impl Into<String>, create_state: F, create_vars: G) -> Self
    where
        F: Fn(Option<&Value>) -> Result<S, ActorError> + Send + Sync + 'static,
        G: Fn(Option<DriverContext>) -> V + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            create_state: Arc::new(create_state),
            create_vars: Arc::new(create_vars),
            on_create: None,
            on_start: None,
            on_stop: None,
            on_before_connect: None,
            on_auth: None,
            create_conn_state: None,
            on_connect: None,
            on_disconnect: None,
            on_before_action_response: None,
            on_raw_websocket: None,
            actions: HashMap::new(),
            options: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the runtime wide execution limits for this actor.
    pub fn options(mut self, options: ActorOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Register an async action. It is cancelled when it exceeds the action timeout.
    pub fn action<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActionContext<S, V>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
    {
        self.actions.insert(
            name.into(),
            ActionHandler::Async(Arc::new(
                move |ctx: ActionContext<S, V>, args: Vec<Value>| -> HookResult<Value> {
                    Box::pin(handler(ctx, args))
                },
            )),
        );
        self
    }

    /// Register an action that completes without awaiting.
    pub fn sync_action<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ActionContext<S, V>, Vec<Value>) -> Result<Value, ActorError> + Send + Sync + 'static,
    {
        self.actions
            .insert(name.into(), ActionHandler::Sync(Arc::new(handler)));
        self
    }

    /// Runs once, the first time the actor starts, after `create_state`.
    pub fn on_create<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_create = Some(Arc::new(
            move |ctx: ActionContext<S, V>, input: Option<Value>| -> HookResult<()> {
                Box::pin(hook(ctx, input))
            },
        ));
        self
    }

    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_start = Some(Arc::new(move |ctx: ActionContext<S, V>| -> HookResult<()> {
            Box::pin(hook(ctx))
        }));
        self
    }

    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_stop = Some(Arc::new(move |ctx: ActionContext<S, V>| -> HookResult<()> {
            Box::pin(hook(ctx))
        }));
        self
    }

    /// Validate a connection attempt before any transport is materialized.
    /// Returning an error rejects the connection.
    pub fn on_before_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, ConnectRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_before_connect = Some(Arc::new(
            move |ctx: ActionContext<S, V>, req: ConnectRequest| -> HookResult<()> {
                Box::pin(hook(ctx, req))
            },
        ));
        self
    }

    /// Authenticate a connection attempt. The returned value becomes the
    /// connection's auth data.
    pub fn on_auth<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, ConnectRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
    {
        self.on_auth = Some(Arc::new(
            move |ctx: ActionContext<S, V>, req: ConnectRequest| -> HookResult<Value> {
                Box::pin(hook(ctx, req))
            },
        ));
        self
    }

    pub fn create_conn_state<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, ConnectRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
    {
        self.create_conn_state = Some(Arc::new(
            move |ctx: ActionContext<S, V>, req: ConnectRequest| -> HookResult<Value> {
                Box::pin(hook(ctx, req))
            },
        ));
        self
    }

    /// Runs after a connection is registered. An error disconnects it.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, Arc<Conn>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(
            move |ctx: ActionContext<S, V>, conn: Arc<Conn>| -> HookResult<()> {
                Box::pin(hook(ctx, conn))
            },
        ));
        self
    }

    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, Arc<Conn>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(
            move |ctx: ActionContext<S, V>, conn: Arc<Conn>| -> HookResult<()> {
                Box::pin(hook(ctx, conn))
            },
        ));
        self
    }

    /// Rewrite an action's output before it is returned to the caller.
    pub fn on_before_action_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, String, Vec<Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
    {
        self.on_before_action_response = Some(Arc::new(
            move |ctx: ActionContext<S, V>,
                  action: String,
                  args: Vec<Value>,
                  output: Value|
                  -> HookResult<Value> { Box::pin(hook(ctx, action, args, output)) },
        ));
        self
    }

    /// Accept raw WebSockets. Actors without this hook reject them.
    pub fn on_raw_websocket<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ActionContext<S, V>, RawWebSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.on_raw_websocket = Some(Arc::new(
            move |ctx: ActionContext<S, V>, socket: RawWebSocket| -> HookResult<()> {
                Box::pin(hook(ctx, socket))
            },
        ));
        self
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub(crate) fn action_handler(&self, name: &str) -> Result<ActionHandler<S, V>, ActorError> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| ActorError::ActionNotFound(name.to_string()))
    }
}

/// Decode positional argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, ActorError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| ActorError::MalformedMessage(format!("argument {}: {}", index, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Empty {}

    #[test]
    fn unknown_actions_fail_closed() {
        let def = ActorDefinition::new("empty", |_| Ok(Empty {}))
            .sync_action("ping", |_ctx, _args| Ok(json!("pong")));
        assert!(def.has_action("ping"));
        assert!(matches!(
            def.action_handler("constructor"),
            Err(ActorError::ActionNotFound(name)) if name == "constructor"
        ));
    }

    #[test]
    fn args_decode_by_position() {
        let args = vec![json!(5), json!("x")];
        assert_eq!(arg::<i64>(&args, 0).unwrap(), 5);
        assert_eq!(arg::<String>(&args, 1).unwrap(), "x");
        assert_eq!(arg::<Option<i64>>(&args, 2).unwrap(), None);
        assert_eq!(arg::<i64>(&args, 1).unwrap_err().code(), "malformed_message");
    }
}
