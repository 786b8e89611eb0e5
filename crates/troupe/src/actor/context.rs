//! Handle passed to actions and hooks.

use serde_json::Value;
use std::sync::Arc;

use crate::actor::conn::Conn;
use crate::actor::definition::{ActorState, ActorVars};
use crate::actor::instance::{ActorInstance, DynActorInstance};
use crate::driver::DriverContext;
use crate::errors::ActorError;
use crate::id::ActorId;
use crate::schedule::Scheduler;

/// # ActionContext
///
/// Gives user code access to the running actor: its state and vars, its
/// connections, broadcasting and the scheduler.
///
/// State changes go through [`ActionContext::mutate_state`]. Every mutation
/// marks the actor dirty and the runtime persists it once the action, hook or
/// scheduled event that made it returns.
pub struct ActionContext<S, V> {
    instance: ActorInstance<S, V>,
    conn: Option<Arc<Conn>>,
}

impl<S, V> Clone for ActionContext<S, V> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            conn: self.conn.clone(),
        }
    }
}

impl<S: ActorState, V: ActorVars> ActionContext<S, V> {
    pub(crate) fn new(instance: ActorInstance<S, V>, conn: Option<Arc<Conn>>) -> Self {
        Self { instance, conn }
    }

    pub fn actor_id(&self) -> &ActorId {
        self.instance.id()
    }

    pub fn name(&self) -> &str {
        self.instance.actor_name()
    }

    pub fn key(&self) -> &[String] {
        self.instance.key()
    }

    /// Read the state.
    pub fn state<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, ActorError> {
        self.instance.with_state(f)
    }

    /// Mutate the state and mark the actor dirty.
    pub fn mutate_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, ActorError> {
        self.instance.mutate_state(f)
    }

    pub fn vars(&self) -> Result<&V, ActorError> {
        self.instance.vars()
    }

    /// The connection that triggered this call, if any.
    pub fn conn(&self) -> Option<&Arc<Conn>> {
        self.conn.as_ref()
    }

    pub fn conns(&self) -> Vec<Arc<Conn>> {
        self.instance.conns()
    }

    /// Send an event to every connection subscribed to it.
    pub fn broadcast(&self, event_name: &str, args: Vec<Value>) {
        self.instance.broadcast(event_name, args);
    }

    pub fn schedule(&self) -> &Scheduler {
        self.instance.scheduler()
    }

    /// Persist immediately instead of waiting for the end of the call.
    pub async fn save_state(&self) -> Result<(), ActorError> {
        self.instance.save_state().await
    }

    pub fn driver_context(&self) -> Option<DriverContext> {
        self.instance.driver_context()
    }

    /// Current time according to the runtime clock, in unix milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.instance.now_ms()
    }
}
