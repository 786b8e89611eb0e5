//! # Runtime Context
//!
//! Process wide collaborators, constructed once and cloned into every
//! component that needs them.

use std::sync::Arc;
use tracing::debug;

use crate::actor::instance::SharedActorInstance;
use crate::clock::{SharedClock, SystemClock};
use crate::config::RuntimeConfig;
use crate::driver::SharedActorDriver;
use crate::drivers::memory::{MemoryActorDriver, MemoryManagerDriver};
use crate::errors::ActorError;
use crate::id::ActorId;
use crate::manager::SharedManagerDriver;
use crate::registry::ActorRegistry;

#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<RuntimeConfig>,
    pub actor_driver: SharedActorDriver,
    pub manager_driver: SharedManagerDriver,
    pub registry: Arc<ActorRegistry>,
    pub clock: SharedClock,
}

/// A context backed by the in-memory drivers, with typed handles kept for
/// inspection.
pub struct MemoryRuntime {
    pub context: RuntimeContext,
    pub actor_driver: Arc<MemoryActorDriver>,
    pub manager_driver: Arc<MemoryManagerDriver>,
}

impl RuntimeContext {
    pub fn new(
        config: RuntimeConfig,
        actor_driver: SharedActorDriver,
        manager_driver: SharedManagerDriver,
        registry: ActorRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            actor_driver,
            manager_driver,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn memory(config: RuntimeConfig, registry: ActorRegistry, clock: SharedClock) -> MemoryRuntime {
        let actor_driver = Arc::new(MemoryActorDriver::new(clock.clone()));
        let manager_driver = Arc::new(MemoryManagerDriver::new());
        let context = Self::new(config, actor_driver.clone(), manager_driver.clone(), registry)
            .with_clock(clock);
        MemoryRuntime {
            context,
            actor_driver,
            manager_driver,
        }
    }

    /// Build an unstarted instance for an existing actor record.
    pub async fn create_instance(&self, actor_id: &ActorId) -> Result<SharedActorInstance, ActorError> {
        let record = self
            .manager_driver
            .get_for_id(actor_id)
            .await?
            .ok_or_else(|| ActorError::ActorNotFound(actor_id.to_string()))?;
        let factory = self.registry.get(&record.name).ok_or_else(|| {
            ActorError::internal(format!("no actor definition registered for `{}`", record.name))
        })?;
        debug!("Creating instance of {} for actor {}", record.name, actor_id);
        Ok(factory.create_instance(
            record,
            &self.config.actor,
            self.actor_driver.clone(),
            self.clock.clone(),
        ))
    }
}
