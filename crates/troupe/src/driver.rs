//! # Actor Driver
//!
//! The narrow persistence interface every storage backend implements. The
//! runtime never talks to a database directly; it reads and writes opaque
//! bytes for an actor, keeps a small key-value namespace for the scheduler,
//! and arms a single wake-up alarm per actor.

use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Weak};

use crate::errors::DriverError;
use crate::id::ActorId;

/// Platform specific ambient object handed to user hooks. Opaque to the runtime.
pub type DriverContext = Arc<dyn Any + Send + Sync>;

#[async_trait]
pub trait ActorDriver: Send + Sync + 'static {
    /// Read the persisted actor record, `None` if nothing has been written yet.
    async fn read_persisted_data(&self, actor_id: &ActorId) -> Result<Option<Vec<u8>>, DriverError>;

    async fn write_persisted_data(&self, actor_id: &ActorId, data: Vec<u8>) -> Result<(), DriverError>;

    /// Set or replace the single wake timer for this actor.
    async fn set_alarm(&self, actor_id: &ActorId, timestamp_ms: i64) -> Result<(), DriverError>;

    /// Clear the wake timer, if any.
    async fn clear_alarm(&self, actor_id: &ActorId) -> Result<(), DriverError>;

    async fn kv_get(&self, actor_id: &ActorId, key: &str) -> Result<Option<Vec<u8>>, DriverError>;

    async fn kv_get_batch(
        &self,
        actor_id: &ActorId,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, DriverError>;

    async fn kv_put(&self, actor_id: &ActorId, key: &str, value: Vec<u8>) -> Result<(), DriverError>;

    async fn kv_delete_batch(&self, actor_id: &ActorId, keys: &[String]) -> Result<(), DriverError>;

    /// Ambient context for user hooks.
    fn get_context(&self, _actor_id: &ActorId) -> Option<DriverContext> {
        None
    }

    /// Register the receiver of fired alarms. Drivers whose alarms are
    /// delivered by the platform itself ignore this.
    fn set_alarm_target(&self, _target: Weak<dyn AlarmTarget>) {}
}

pub type SharedActorDriver = Arc<dyn ActorDriver>;

/// Receiver of alarms fired by a driver.
///
/// Drivers that own real timers deliver expirations here; the topology that
/// loaded the actor forwards them into the leader instance.
#[async_trait]
pub trait AlarmTarget: Send + Sync + 'static {
    async fn on_alarm(&self, actor_id: &ActorId);
}
