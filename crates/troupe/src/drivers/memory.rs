//! In-process drivers. Everything lives in hash maps behind mutexes; alarms
//! are tokio timers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::{SharedClock, SystemClock};
use crate::driver::{ActorDriver, AlarmTarget};
use crate::errors::DriverError;
use crate::id::ActorId;
use crate::manager::{ActorRecord, ManagerDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmCall {
    Set(i64),
    Clear,
}

#[derive(Default)]
struct ActorStorage {
    persisted: Option<Vec<u8>>,
    kv: HashMap<String, Vec<u8>>,
    alarm: Option<i64>,
    alarm_history: Vec<AlarmCall>,
}

pub struct MemoryActorDriver {
    clock: SharedClock,
    actors: Mutex<HashMap<ActorId, ActorStorage>>,
    timers: Mutex<HashMap<ActorId, JoinHandle<()>>>,
    alarm_target: Mutex<Option<Weak<dyn AlarmTarget>>>,
}

impl MemoryActorDriver {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            actors: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            alarm_target: Mutex::new(None),
        }
    }

    /// Every `set_alarm`/`clear_alarm` call made for the actor, in order.
    pub fn alarm_history(&self, actor_id: &ActorId) -> Vec<AlarmCall> {
        lock(&self.actors)
            .get(actor_id)
            .map(|storage| storage.alarm_history.clone())
            .unwrap_or_default()
    }

    pub fn current_alarm(&self, actor_id: &ActorId) -> Option<i64> {
        lock(&self.actors).get(actor_id).and_then(|storage| storage.alarm)
    }

    /// Persisted record decoded as JSON, for assertions.
    pub fn persisted_json(&self, actor_id: &ActorId) -> Option<Value> {
        lock(&self.actors)
            .get(actor_id)
            .and_then(|storage| storage.persisted.as_ref())
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    fn arm_timer(&self, actor_id: &ActorId, timestamp_ms: i64) {
        let target = match lock(&self.alarm_target).clone() {
            Some(target) => target,
            None => return,
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let delay = (timestamp_ms - self.clock.now_ms()).max(0) as u64;
        let id = actor_id.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            if let Some(target) = target.upgrade() {
                trace!("Alarm fired for actor {}", id);
                // Detached so re-arming from inside the alarm does not abort it
                tokio::spawn(async move { target.on_alarm(&id).await });
            }
        });

        if let Some(previous) = lock(&self.timers).insert(actor_id.clone(), handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, actor_id: &ActorId) {
        if let Some(previous) = lock(&self.timers).remove(actor_id) {
            previous.abort();
        }
    }
}

impl Default for MemoryActorDriver {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Drop for MemoryActorDriver {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.timers).drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ActorDriver for MemoryActorDriver {
    async fn read_persisted_data(&self, actor_id: &ActorId) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(lock(&self.actors)
            .get(actor_id)
            .and_then(|storage| storage.persisted.clone()))
    }

    async fn write_persisted_data(&self, actor_id: &ActorId, data: Vec<u8>) -> Result<(), DriverError> {
        lock(&self.actors).entry(actor_id.clone()).or_default().persisted = Some(data);
        Ok(())
    }

    async fn set_alarm(&self, actor_id: &ActorId, timestamp_ms: i64) -> Result<(), DriverError> {
        {
            let mut actors = lock(&self.actors);
            let storage = actors.entry(actor_id.clone()).or_default();
            storage.alarm = Some(timestamp_ms);
            storage.alarm_history.push(AlarmCall::Set(timestamp_ms));
        }
        debug!("Alarm for actor {} set to {}", actor_id, timestamp_ms);
        self.arm_timer(actor_id, timestamp_ms);
        Ok(())
    }

    async fn clear_alarm(&self, actor_id: &ActorId) -> Result<(), DriverError> {
        {
            let mut actors = lock(&self.actors);
            let storage = actors.entry(actor_id.clone()).or_default();
            storage.alarm = None;
            storage.alarm_history.push(AlarmCall::Clear);
        }
        self.cancel_timer(actor_id);
        Ok(())
    }

    async fn kv_get(&self, actor_id: &ActorId, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(lock(&self.actors)
            .get(actor_id)
            .and_then(|storage| storage.kv.get(key).cloned()))
    }

    async fn kv_get_batch(
        &self,
        actor_id: &ActorId,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, DriverError> {
        let actors = lock(&self.actors);
        let storage = actors.get(actor_id);
        Ok(keys
            .iter()
            .map(|key| storage.and_then(|s| s.kv.get(key).cloned()))
            .collect())
    }

    async fn kv_put(&self, actor_id: &ActorId, key: &str, value: Vec<u8>) -> Result<(), DriverError> {
        lock(&self.actors)
            .entry(actor_id.clone())
            .or_default()
            .kv
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn kv_delete_batch(&self, actor_id: &ActorId, keys: &[String]) -> Result<(), DriverError> {
        if let Some(storage) = lock(&self.actors).get_mut(actor_id) {
            for key in keys {
                storage.kv.remove(key);
            }
        }
        Ok(())
    }

    fn set_alarm_target(&self, target: Weak<dyn AlarmTarget>) {
        *lock(&self.alarm_target) = Some(target);
    }
}

#[derive(Default)]
struct ManagerTables {
    by_id: HashMap<ActorId, ActorRecord>,
    by_key: HashMap<(String, Vec<String>), ActorId>,
}

#[derive(Default)]
pub struct MemoryManagerDriver {
    tables: Mutex<ManagerTables>,
}

impl MemoryManagerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor_count(&self) -> usize {
        lock(&self.tables).by_id.len()
    }
}

#[async_trait]
impl ManagerDriver for MemoryManagerDriver {
    async fn get_for_id(&self, actor_id: &ActorId) -> Result<Option<ActorRecord>, DriverError> {
        Ok(lock(&self.tables).by_id.get(actor_id).cloned())
    }

    async fn get_with_key(&self, name: &str, key: &[String]) -> Result<Option<ActorRecord>, DriverError> {
        let tables = lock(&self.tables);
        Ok(tables
            .by_key
            .get(&(name.to_string(), key.to_vec()))
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn create_actor(
        &self,
        name: &str,
        key: &[String],
        input: Option<Value>,
    ) -> Result<ActorRecord, DriverError> {
        let mut tables = lock(&self.tables);
        let lookup = (name.to_string(), key.to_vec());
        if tables.by_key.contains_key(&lookup) {
            return Err(DriverError::ActorAlreadyExists {
                name: name.to_string(),
                key: key.to_vec(),
            });
        }

        let record = ActorRecord {
            actor_id: ActorId::generate(),
            name: name.to_string(),
            key: key.to_vec(),
            input,
        };
        tables.by_key.insert(lookup, record.actor_id.clone());
        tables.by_id.insert(record.actor_id.clone(), record.clone());
        Ok(record)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TokioClock};
    use crate::manager::get_or_create_actor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn create_rejects_duplicate_keys() {
        let manager = MemoryManagerDriver::new();
        let key = vec!["room-1".to_string()];
        let record = manager.create_actor("chat", &key, None).await.unwrap();

        let err = manager.create_actor("chat", &key, None).await.unwrap_err();
        assert!(matches!(err, DriverError::ActorAlreadyExists { .. }));

        let same = get_or_create_actor(&manager, "chat", &key, None).await.unwrap();
        assert_eq!(same.actor_id, record.actor_id);
        assert_eq!(manager.actor_count(), 1);
    }

    #[tokio::test]
    async fn batch_reads_preserve_key_order() {
        let driver = MemoryActorDriver::default();
        let id = ActorId::new("a");
        driver.kv_put(&id, "x", vec![1]).await.unwrap();
        driver.kv_put(&id, "z", vec![3]).await.unwrap();

        let values = driver
            .kv_get_batch(&id, &["z".to_string(), "y".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(vec![3]), None, Some(vec![1])]);

        driver.kv_delete_batch(&id, &["x".to_string()]).await.unwrap();
        assert_eq!(driver.kv_get(&id, "x").await.unwrap(), None);
    }

    struct CountingTarget(AtomicUsize);

    #[async_trait]
    impl AlarmTarget for CountingTarget {
        async fn on_alarm(&self, _actor_id: &ActorId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timers_deliver_to_the_target() {
        let clock = Arc::new(TokioClock::new());
        let driver = MemoryActorDriver::new(clock.clone());
        let target = Arc::new(CountingTarget(AtomicUsize::new(0)));
        let weak: Weak<dyn AlarmTarget> = Arc::downgrade(&(target.clone() as Arc<dyn AlarmTarget>));
        driver.set_alarm_target(weak);

        let id = ActorId::new("a");
        driver.set_alarm(&id, clock.now_ms() + 1_000).await.unwrap();
        // Replacing the alarm cancels the first timer
        driver.set_alarm(&id, clock.now_ms() + 2_000).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 0);

        tokio::time::sleep(std::time::Duration::from_millis(1_000)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
    }
}
