//! # Manager Driver
//!
//! Maps `(name, key)` onto actor ids and creates actor records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::errors::DriverError;
use crate::id::{ActorId, ActorKey};

/// Identity of a durable actor record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub actor_id: ActorId,
    pub name: String,
    pub key: ActorKey,
    /// Input given at creation, handed to `create_state` on first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[async_trait]
pub trait ManagerDriver: Send + Sync + 'static {
    async fn get_for_id(&self, actor_id: &ActorId) -> Result<Option<ActorRecord>, DriverError>;

    async fn get_with_key(&self, name: &str, key: &[String]) -> Result<Option<ActorRecord>, DriverError>;

    /// Create a new actor record. Fails with `ActorAlreadyExists` when the
    /// `(name, key)` pair is taken.
    async fn create_actor(
        &self,
        name: &str,
        key: &[String],
        input: Option<Value>,
    ) -> Result<ActorRecord, DriverError>;
}

pub type SharedManagerDriver = Arc<dyn ManagerDriver>;

/// Resolve an actor by name and key, creating it if it does not exist yet.
///
/// Two callers racing to create the same actor both end up with the record
/// that won the race.
pub async fn get_or_create_actor(
    manager: &dyn ManagerDriver,
    name: &str,
    key: &[String],
    input: Option<Value>,
) -> Result<ActorRecord, DriverError> {
    if let Some(record) = manager.get_with_key(name, key).await? {
        return Ok(record);
    }

    match manager.create_actor(name, key, input).await {
        Ok(record) => {
            debug!("Created actor {} ({}) {:?}", record.actor_id, name, key);
            Ok(record)
        }
        Err(DriverError::ActorAlreadyExists { .. }) => manager
            .get_with_key(name, key)
            .await?
            .ok_or_else(|| DriverError::ActorNotFound(format!("{} {:?}", name, key))),
        Err(e) => Err(e),
    }
}
