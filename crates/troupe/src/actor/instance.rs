//! # Actor Instance
//!
//! The in-memory, running form of one actor on one node. An instance owns the
//! actor's state and vars, its connections and its scheduler, and is the only
//! place state is mutated.
//!
//! Lifecycle: `uninitialized -> starting -> running -> stopped`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::actor::conn::{Conn, ConnDriver, ConnDriverKind, PersistedConn, PreparedConn};
use crate::actor::context::ActionContext;
use crate::actor::definition::{ActionHandler, ActorDefinition, ActorState, ActorVars, ConnectRequest, RequestInfo};
use crate::actor::protocol::{ToClient, ToServer};
use crate::actor::raw_websocket::RawWebSocket;
use crate::clock::SharedClock;
use crate::config::ActorOptions;
use crate::driver::{DriverContext, SharedActorDriver};
use crate::errors::ActorError;
use crate::id::{ActorId, ActorKey, ConnId};
use crate::manager::ActorRecord;
use crate::schedule::{AlarmReport, EventInvoker, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    Uninitialized,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorStatus::Uninitialized => write!(f, "uninitialized"),
            ActorStatus::Starting => write!(f, "starting"),
            ActorStatus::Running => write!(f, "running"),
            ActorStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// The persisted actor record, stored as JSON through the actor driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedActor {
    pub initialized: bool,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub conns: Vec<PersistedConn>,
}

/// Type erased view of an instance used by topologies and the router.
#[async_trait]
pub trait DynActorInstance: Send + Sync + 'static {
    fn actor_id(&self) -> &ActorId;

    fn name(&self) -> &str;

    fn status(&self) -> ActorStatus;

    fn options(&self) -> &ActorOptions;

    fn get_conn(&self, conn_id: &ConnId) -> Option<Arc<Conn>>;

    fn conn_ids(&self) -> Vec<ConnId>;

    /// Load persisted data and run the startup hooks. Concurrent callers
    /// share one start.
    async fn start(&self) -> Result<(), ActorError>;

    /// Stop the actor, persist it and close every connection.
    async fn stop(&self) -> Result<(), ActorError>;

    /// Run the connect hooks without registering anything.
    async fn prepare_conn(&self, params: Value, request: RequestInfo) -> Result<PreparedConn, ActorError>;

    async fn create_conn(
        &self,
        conn_id: ConnId,
        conn_token: String,
        prepared: PreparedConn,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<Arc<Conn>, ActorError>;

    /// Attach a new transport to a persisted connection.
    async fn reconnect_conn(
        &self,
        conn_id: &ConnId,
        conn_token: &str,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<Arc<Conn>, ActorError>;

    async fn process_message(
        &self,
        conn_id: &ConnId,
        conn_token: &str,
        message: ToServer,
    ) -> Result<(), ActorError>;

    async fn execute_action(
        &self,
        conn: Option<Arc<Conn>>,
        action_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ActorError>;

    async fn remove_conn(&self, conn_id: &ConnId) -> Result<(), ActorError>;

    /// Close the connection's transport, then remove it.
    async fn disconnect_conn(&self, conn_id: &ConnId, reason: Option<String>) -> Result<(), ActorError>;

    async fn handle_raw_websocket(&self, socket: RawWebSocket) -> Result<(), ActorError>;

    async fn on_alarm(&self) -> Result<AlarmReport, ActorError>;

    async fn save_state(&self) -> Result<(), ActorError>;
}

pub type SharedActorInstance = Arc<dyn DynActorInstance>;

struct Inner<S, V> {
    actor_id: ActorId,
    name: String,
    key: ActorKey,
    input: Option<Value>,
    definition: Arc<ActorDefinition<S, V>>,
    options: ActorOptions,
    driver: SharedActorDriver,
    clock: SharedClock,
    scheduler: Scheduler,
    status: Mutex<ActorStatus>,
    started: OnceCell<()>,
    state: Mutex<Option<S>>,
    vars: OnceLock<V>,
    conns: Mutex<HashMap<ConnId, Arc<Conn>>>,
    subscriptions: Mutex<HashMap<String, HashSet<ConnId>>>,
    dirty: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
    span: Span,
}

/// # ActorInstance
///
/// A cheaply cloneable handle to a running actor.
///
/// ## Persistence
///
/// State is persisted as one JSON record (see [`PersistedActor`]) after every
/// action, hook or scheduled event that marked the actor dirty. Writes are
/// serialized; the snapshot is taken after the write lock is acquired so the
/// latest state always wins.
pub struct ActorInstance<S, V> {
    inner: Arc<Inner<S, V>>,
}

impl<S, V> Clone for ActorInstance<S, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ActorState, V: ActorVars> ActorInstance<S, V> {
    pub fn new(
        record: ActorRecord,
        definition: Arc<ActorDefinition<S, V>>,
        default_options: &ActorOptions,
        driver: SharedActorDriver,
        clock: SharedClock,
    ) -> Self {
        let options = definition
            .options
            .clone()
            .unwrap_or_else(|| default_options.clone());
        let span = info_span!("actor", actor_id = %record.actor_id, name = %record.name);
        let scheduler = Scheduler::new(record.actor_id.clone(), driver.clone(), clock.clone());
        Self {
            inner: Arc::new(Inner {
                actor_id: record.actor_id,
                name: record.name,
                key: record.key,
                input: record.input,
                definition,
                options,
                driver,
                clock,
                scheduler,
                status: Mutex::new(ActorStatus::Uninitialized),
                started: OnceCell::new(),
                state: Mutex::new(None),
                vars: OnceLock::new(),
                conns: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                dirty: AtomicBool::new(false),
                write_lock: tokio::sync::Mutex::new(()),
                span,
            }),
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.inner.actor_id
    }

    pub fn actor_name(&self) -> &str {
        &self.inner.name
    }

    pub fn key(&self) -> &[String] {
        &self.inner.key
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    pub fn driver_context(&self) -> Option<DriverContext> {
        self.inner.driver.get_context(&self.inner.actor_id)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, ActorError> {
        let guard = lock(&self.inner.state);
        guard.as_ref().map(f).ok_or(ActorError::ActorNotReady)
    }

    pub fn mutate_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, ActorError> {
        let mut guard = lock(&self.inner.state);
        let state = guard.as_mut().ok_or(ActorError::ActorNotReady)?;
        let result = f(state);
        self.inner.dirty.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub fn vars(&self) -> Result<&V, ActorError> {
        self.inner.vars.get().ok_or(ActorError::ActorNotReady)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    pub fn conns(&self) -> Vec<Arc<Conn>> {
        lock(&self.inner.conns).values().cloned().collect()
    }

    pub fn broadcast(&self, event_name: &str, args: Vec<Value>) {
        let subscribers: Vec<Arc<Conn>> = {
            let subscriptions = lock(&self.inner.subscriptions);
            let conns = lock(&self.inner.conns);
            match subscriptions.get(event_name) {
                Some(ids) => ids.iter().filter_map(|id| conns.get(id).cloned()).collect(),
                None => Vec::new(),
            }
        };
        debug!(
            parent: &self.inner.span,
            "Broadcasting {} to {} conns",
            event_name,
            subscribers.len()
        );
        let message = ToClient::Event {
            name: event_name.to_string(),
            args,
        };
        for conn in subscribers {
            conn.send_message(&message);
        }
    }

    fn context(&self, conn: Option<Arc<Conn>>) -> ActionContext<S, V> {
        ActionContext::new(self.clone(), conn)
    }

    fn set_status(&self, status: ActorStatus) {
        *lock(&self.inner.status) = status;
    }

    fn ensure_running(&self) -> Result<(), ActorError> {
        match *lock(&self.inner.status) {
            ActorStatus::Running => Ok(()),
            ActorStatus::Stopped => Err(ActorError::ActorStopped),
            ActorStatus::Uninitialized | ActorStatus::Starting => Err(ActorError::ActorNotReady),
        }
    }

    fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    async fn persist_if_dirty(&self) -> Result<(), ActorError> {
        if self.inner.dirty.load(Ordering::SeqCst) {
            self.write_state().await?;
        }
        Ok(())
    }

    async fn write_state(&self) -> Result<(), ActorError> {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.dirty.store(false, Ordering::SeqCst);
        let bytes = match self.snapshot() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mark_dirty();
                return Err(e);
            }
        };
        if let Err(e) = self
            .inner
            .driver
            .write_persisted_data(&self.inner.actor_id, bytes)
            .await
        {
            self.mark_dirty();
            error!(parent: &self.inner.span, "Failed to persist actor: {}", e);
            return Err(e.into());
        }
        debug!(parent: &self.inner.span, "Persisted actor state");
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ActorError> {
        let state = {
            let guard = lock(&self.inner.state);
            match guard.as_ref() {
                Some(state) => serde_json::to_value(state)
                    .map_err(|e| ActorError::InvalidStateType(e.to_string()))?,
                None => return Err(ActorError::ActorNotReady),
            }
        };
        let mut conns: Vec<PersistedConn> = lock(&self.inner.conns)
            .values()
            .map(|conn| conn.to_persisted())
            .collect();
        conns.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));

        let record = PersistedActor {
            initialized: true,
            input: self.inner.input.clone(),
            state,
            conns,
        };
        serde_json::to_vec(&record).map_err(ActorError::internal)
    }

    /// Run a hook under a timeout.
    async fn run_hook<T>(
        &self,
        hook_name: &str,
        duration: Duration,
        fut: impl Future<Output = Result<T, ActorError>>,
    ) -> Result<T, ActorError> {
        match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(parent: &self.inner.span, "`{}` timed out after {:?}", hook_name, duration);
                Err(ActorError::ActionTimedOut)
            }
        }
    }

    async fn run_start(&self) -> Result<(), ActorError> {
        self.set_status(ActorStatus::Starting);
        match self.initialize().await {
            Ok(()) => {
                self.set_status(ActorStatus::Running);
                info!("Actor started");
                Ok(())
            }
            Err(e) => {
                error!("Actor failed to start: {}", e);
                self.set_status(ActorStatus::Uninitialized);
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<(), ActorError> {
        let definition = self.inner.definition.clone();
        let persisted = match self
            .inner
            .driver
            .read_persisted_data(&self.inner.actor_id)
            .await?
        {
            Some(bytes) => Some(
                serde_json::from_slice::<PersistedActor>(&bytes)
                    .map_err(|e| ActorError::internal(format!("corrupt persisted actor: {}", e)))?,
            ),
            None => None,
        };

        let _ = self
            .inner
            .vars
            .set((definition.create_vars)(self.driver_context()));

        match persisted {
            Some(record) if record.initialized => {
                let state: S = serde_json::from_value(record.state)
                    .map_err(|e| ActorError::InvalidStateType(e.to_string()))?;
                *lock(&self.inner.state) = Some(state);
                self.restore_conns(record.conns);
                debug!("Restored persisted state");
            }
            _ => {
                let state = (definition.create_state)(self.inner.input.as_ref())?;
                *lock(&self.inner.state) = Some(state);
                if let Some(hook) = &definition.on_create {
                    hook(self.context(None), self.inner.input.clone()).await?;
                }
                self.write_state().await?;
                debug!("Created initial state");
            }
        }

        self.inner.scheduler.restore_alarm().await?;

        if let Some(hook) = &definition.on_start {
            hook(self.context(None)).await?;
        }
        self.persist_if_dirty().await
    }

    fn restore_conns(&self, persisted: Vec<PersistedConn>) {
        let mut conns = lock(&self.inner.conns);
        let mut subscriptions = lock(&self.inner.subscriptions);
        for record in persisted {
            let conn = Arc::new(Conn::restore(record));
            for event in conn.subscriptions() {
                subscriptions.entry(event).or_default().insert(conn.id().clone());
            }
            conns.insert(conn.id().clone(), conn);
        }
    }

    fn set_subscription(&self, conn: &Conn, event_name: &str, subscribe: bool) {
        conn.set_subscribed(event_name, subscribe);
        let mut subscriptions = lock(&self.inner.subscriptions);
        if subscribe {
            subscriptions
                .entry(event_name.to_string())
                .or_default()
                .insert(conn.id().clone());
        } else if let Some(ids) = subscriptions.get_mut(event_name) {
            ids.remove(conn.id());
            if ids.is_empty() {
                subscriptions.remove(event_name);
            }
        }
        self.mark_dirty();
    }

    fn take_conn(&self, conn_id: &ConnId) -> Option<Arc<Conn>> {
        let conn = lock(&self.inner.conns).remove(conn_id)?;
        let mut subscriptions = lock(&self.inner.subscriptions);
        subscriptions.retain(|_, ids| {
            ids.remove(conn_id);
            !ids.is_empty()
        });
        self.mark_dirty();
        Some(conn)
    }

    async fn call_action(
        &self,
        conn: Option<Arc<Conn>>,
        action_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ActorError> {
        self.ensure_running()?;
        let definition = self.inner.definition.clone();
        let handler = definition.action_handler(action_name)?;
        let ctx = self.context(conn);

        let result = match handler {
            ActionHandler::Sync(f) => f(&ctx, args.clone()),
            ActionHandler::Async(f) => {
                let timeout = self.inner.options.action_timeout();
                match tokio::time::timeout(timeout, f(ctx.clone(), args.clone())).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Action {} timed out after {:?}", action_name, timeout);
                        Err(ActorError::ActionTimedOut)
                    }
                }
            }
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if e.is_public() {
                    debug!("Action {} failed: {}", action_name, e);
                } else {
                    error!("Action {} failed with internal error: {:?}", action_name, e);
                }
                // Mutations made before the failure are still committed
                if let Err(persist_err) = self.persist_if_dirty().await {
                    error!("Failed to persist after failed action: {}", persist_err);
                }
                return Err(e);
            }
        };

        let output = match &definition.on_before_action_response {
            Some(hook) => hook(ctx, action_name.to_string(), args, output).await?,
            None => output,
        };

        self.persist_if_dirty().await?;
        Ok(output)
    }
}

#[async_trait]
impl<S: ActorState, V: ActorVars> DynActorInstance for ActorInstance<S, V> {
    fn actor_id(&self) -> &ActorId {
        &self.inner.actor_id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn status(&self) -> ActorStatus {
        *lock(&self.inner.status)
    }

    fn options(&self) -> &ActorOptions {
        &self.inner.options
    }

    fn get_conn(&self, conn_id: &ConnId) -> Option<Arc<Conn>> {
        lock(&self.inner.conns).get(conn_id).cloned()
    }

    fn conn_ids(&self) -> Vec<ConnId> {
        lock(&self.inner.conns).keys().cloned().collect()
    }

    async fn start(&self) -> Result<(), ActorError> {
        if self.status() == ActorStatus::Stopped {
            return Err(ActorError::ActorStopped);
        }
        self.inner
            .started
            .get_or_try_init(|| self.run_start().instrument(self.inner.span.clone()))
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ActorError> {
        let previous = {
            let mut status = lock(&self.inner.status);
            let previous = *status;
            *status = ActorStatus::Stopped;
            previous
        };
        if previous == ActorStatus::Stopped {
            return Ok(());
        }
        let span = self.inner.span.clone();
        async {
            if let Some(hook) = &self.inner.definition.on_stop {
                if let Err(e) = hook(self.context(None)).await {
                    error!("`on_stop` failed: {}", e);
                }
            }

            let has_state = lock(&self.inner.state).is_some();
            let saved = if has_state {
                self.write_state().await
            } else {
                Ok(())
            };

            let conns = self.conns();
            futures::future::join_all(
                conns
                    .iter()
                    .map(|conn| conn.disconnect(Some("Actor stopped".to_string()))),
            )
            .await;
            info!("Actor stopped, closed {} conns", conns.len());
            saved
        }
        .instrument(span)
        .await
    }

    async fn prepare_conn(&self, params: Value, request: RequestInfo) -> Result<PreparedConn, ActorError> {
        self.ensure_running()?;
        let size = serde_json::to_vec(&params).map_err(ActorError::internal)?.len();
        if size > self.inner.options.max_conn_params_size {
            return Err(ActorError::ConnParamsTooLong);
        }

        let definition = self.inner.definition.clone();
        let connect = ConnectRequest {
            params: params.clone(),
            request,
        };
        let timeout = self.inner.options.on_connect_timeout();

        if let Some(hook) = &definition.on_before_connect {
            self.run_hook("on_before_connect", timeout, hook(self.context(None), connect.clone()))
                .await?;
        }

        let auth = match &definition.on_auth {
            Some(hook) => Some(
                self.run_hook("on_auth", timeout, hook(self.context(None), connect.clone()))
                    .await?,
            ),
            None => None,
        };

        let state = match &definition.create_conn_state {
            Some(hook) => {
                self.run_hook(
                    "create_conn_state",
                    self.inner.options.create_conn_state_timeout(),
                    hook(self.context(None), connect),
                )
                .await?
            }
            None => Value::Null,
        };

        Ok(PreparedConn { params, auth, state })
    }

    async fn create_conn(
        &self,
        conn_id: ConnId,
        conn_token: String,
        prepared: PreparedConn,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<Arc<Conn>, ActorError> {
        self.ensure_running()?;
        let conn = Arc::new(Conn::new(conn_id.clone(), conn_token, prepared, driver));
        {
            let mut conns = lock(&self.inner.conns);
            if conns.contains_key(&conn_id) {
                return Err(ActorError::Unreachable(format!("duplicate conn id {}", conn_id)));
            }
            conns.insert(conn_id.clone(), conn.clone());
        }
        self.mark_dirty();

        if conn.driver_kind() != ConnDriverKind::Http {
            conn.send_message(&ToClient::Init {
                actor_id: self.inner.actor_id.clone(),
                conn_id: conn_id.clone(),
                conn_token: conn.token().to_string(),
            });
        }

        if let Some(hook) = &self.inner.definition.on_connect {
            let result = self
                .run_hook(
                    "on_connect",
                    self.inner.options.on_connect_timeout(),
                    hook(self.context(Some(conn.clone())), conn.clone()),
                )
                .instrument(self.inner.span.clone())
                .await;
            if let Err(e) = result {
                error!(parent: &self.inner.span, "`on_connect` failed for conn {}: {}", conn_id, e);
                conn.disconnect(Some("`on_connect` failed".to_string())).await;
                self.take_conn(&conn_id);
                self.persist_if_dirty().await?;
                return Err(e);
            }
        }

        self.persist_if_dirty().await?;
        info!(parent: &self.inner.span, "Conn {} connected ({:?})", conn_id, conn.driver_kind());
        Ok(conn)
    }

    async fn reconnect_conn(
        &self,
        conn_id: &ConnId,
        conn_token: &str,
        driver: Arc<dyn ConnDriver>,
    ) -> Result<Arc<Conn>, ActorError> {
        self.ensure_running()?;
        let conn = self
            .get_conn(conn_id)
            .ok_or_else(|| ActorError::ConnNotFound(conn_id.to_string()))?;
        conn.verify_token(conn_token)?;

        if let Some(previous) = conn.attach_driver(driver) {
            let id = conn_id.clone();
            tokio::spawn(async move {
                previous
                    .disconnect(&id, Some("Replaced by reconnect".to_string()))
                    .await
            });
        }
        conn.send_message(&ToClient::Init {
            actor_id: self.inner.actor_id.clone(),
            conn_id: conn_id.clone(),
            conn_token: conn.token().to_string(),
        });
        info!(parent: &self.inner.span, "Conn {} reconnected", conn_id);
        Ok(conn)
    }

    async fn process_message(
        &self,
        conn_id: &ConnId,
        conn_token: &str,
        message: ToServer,
    ) -> Result<(), ActorError> {
        let conn = self
            .get_conn(conn_id)
            .ok_or_else(|| ActorError::ConnNotFound(conn_id.to_string()))?;
        conn.verify_token(conn_token)?;

        match message {
            ToServer::ActionRequest { id, name, args } => {
                match self.execute_action(Some(conn.clone()), &name, args).await {
                    Ok(output) => conn.send_message(&ToClient::ActionResponse { id, output }),
                    Err(e) => conn.send_message(&ToClient::error(&e, Some(id))),
                }
            }
            ToServer::SubscriptionRequest {
                event_name,
                subscribe,
            } => {
                debug!(
                    parent: &self.inner.span,
                    "Conn {} {} {}",
                    conn_id,
                    if subscribe { "subscribed to" } else { "unsubscribed from" },
                    event_name
                );
                self.set_subscription(&conn, &event_name, subscribe);
                self.persist_if_dirty().await?;
            }
        }
        Ok(())
    }

    async fn execute_action(
        &self,
        conn: Option<Arc<Conn>>,
        action_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ActorError> {
        let span = info_span!(parent: &self.inner.span, "action", name = %action_name);
        self.call_action(conn, action_name, args).instrument(span).await
    }

    async fn remove_conn(&self, conn_id: &ConnId) -> Result<(), ActorError> {
        if self.status() == ActorStatus::Stopped {
            return Ok(());
        }
        let Some(conn) = self.take_conn(conn_id) else {
            debug!(parent: &self.inner.span, "Conn {} already removed", conn_id);
            return Ok(());
        };

        if let Some(hook) = &self.inner.definition.on_disconnect {
            if let Err(e) = hook(self.context(Some(conn.clone())), conn.clone())
                .instrument(self.inner.span.clone())
                .await
            {
                error!(parent: &self.inner.span, "`on_disconnect` failed for conn {}: {}", conn_id, e);
            }
        }

        self.persist_if_dirty().await?;
        info!(parent: &self.inner.span, "Conn {} disconnected", conn_id);
        Ok(())
    }

    async fn disconnect_conn(&self, conn_id: &ConnId, reason: Option<String>) -> Result<(), ActorError> {
        let conn = self
            .get_conn(conn_id)
            .ok_or_else(|| ActorError::ConnNotFound(conn_id.to_string()))?;
        conn.disconnect(reason).await;
        self.remove_conn(conn_id).await
    }

    async fn handle_raw_websocket(&self, socket: RawWebSocket) -> Result<(), ActorError> {
        self.ensure_running()?;
        let hook = self
            .inner
            .definition
            .on_raw_websocket
            .clone()
            .ok_or_else(|| ActorError::Unsupported("raw websockets".to_string()))?;
        debug!(parent: &self.inner.span, "Raw websocket {} opened", socket.id());
        hook(self.context(None), socket)
            .instrument(self.inner.span.clone())
            .await?;
        self.persist_if_dirty().await
    }

    async fn on_alarm(&self) -> Result<AlarmReport, ActorError> {
        self.start().await?;
        let report = self
            .inner
            .scheduler
            .on_alarm(self)
            .instrument(self.inner.span.clone())
            .await?;
        self.persist_if_dirty().await?;
        Ok(report)
    }

    async fn save_state(&self) -> Result<(), ActorError> {
        self.write_state().await
    }
}

#[async_trait]
impl<S: ActorState, V: ActorVars> EventInvoker for ActorInstance<S, V> {
    async fn invoke_event(&self, fn_name: &str, args: Vec<Value>) -> Result<(), ActorError> {
        self.execute_action(None, fn_name, args).await.map(|_| ())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
