//! # Actor Registry
//!
//! Maps actor names onto the definitions that can instantiate them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::actor::definition::{ActorDefinition, ActorState, ActorVars};
use crate::actor::instance::{ActorInstance, SharedActorInstance};
use crate::clock::SharedClock;
use crate::config::ActorOptions;
use crate::driver::SharedActorDriver;
use crate::manager::ActorRecord;

/// Builds type erased instances of one actor kind.
pub trait ActorFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn create_instance(
        &self,
        record: ActorRecord,
        default_options: &ActorOptions,
        driver: SharedActorDriver,
        clock: SharedClock,
    ) -> SharedActorInstance;
}

struct DefinitionFactory<S, V> {
    definition: Arc<ActorDefinition<S, V>>,
}

impl<S: ActorState, V: ActorVars> ActorFactory for DefinitionFactory<S, V> {
    fn name(&self) -> &str {
        self.definition.name()
    }

    fn create_instance(
        &self,
        record: ActorRecord,
        default_options: &ActorOptions,
        driver: SharedActorDriver,
        clock: SharedClock,
    ) -> SharedActorInstance {
        Arc::new(ActorInstance::new(
            record,
            self.definition.clone(),
            default_options,
            driver,
            clock,
        ))
    }
}

#[derive(Default)]
pub struct ActorRegistry {
    factories: HashMap<String, Arc<dyn ActorFactory>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its name, replacing any previous one.
    pub fn register<S: ActorState, V: ActorVars>(&mut self, definition: ActorDefinition<S, V>) {
        let name = definition.name().to_string();
        self.factories.insert(
            name,
            Arc::new(DefinitionFactory {
                definition: Arc::new(definition),
            }),
        );
    }

    pub fn with<S: ActorState, V: ActorVars>(mut self, definition: ActorDefinition<S, V>) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActorFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|name| name.as_str()).collect();
        names.sort();
        names
    }
}
