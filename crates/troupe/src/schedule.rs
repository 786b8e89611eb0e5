//! # Scheduler
//!
//! Durable delayed callbacks for one actor.
//!
//! Two structures live in the driver's key-value namespace:
//!
//! * `schedule/index`: the sorted list of `{timestamp, event_id}` pairs
//! * `schedule/event/{event_id}`: one record per pending event (function name and args)
//!
//! The platform alarm always points at the first entry of the index, or is
//! cleared when the index is empty. Scheduling only touches the alarm when
//! the new event becomes the earliest one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::clock::SharedClock;
use crate::driver::SharedActorDriver;
use crate::errors::{ActorError, SerializedError};
use crate::id::{generate_message_id, ActorId};

pub const SCHEDULE_INDEX_KEY: &str = "schedule/index";

pub fn event_key(event_id: &str) -> String {
    format!("schedule/event/{}", event_id)
}

pub fn error_key(fn_name: &str) -> String {
    format!("schedule/error/{}", fn_name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleIndexEntry {
    pub timestamp: i64,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub event_id: String,
    pub timestamp: i64,
    #[serde(rename = "fn")]
    pub fn_name: String,
    pub args: Vec<Value>,
}

/// Last failure of a scheduled function, kept under `schedule/error/{fn}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleErrorRecord {
    pub event_id: String,
    pub fn_name: String,
    pub args: Vec<Value>,
    pub scheduled_at: i64,
    pub failed_at: i64,
    pub error: SerializedError,
}

/// Runs a due event by function name.
#[async_trait]
pub trait EventInvoker: Send + Sync {
    async fn invoke_event(&self, fn_name: &str, args: Vec<Value>) -> Result<(), ActorError>;
}

/// Outcome of one alarm firing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmReport {
    /// Events executed, in order
    pub executed: Vec<String>,
    /// Events whose invocation failed
    pub failed: Vec<String>,
}

pub struct Scheduler {
    actor_id: ActorId,
    driver: SharedActorDriver,
    clock: SharedClock,
    /// Guards the read-modify-write of the index
    index_lock: Mutex<()>,
    /// At most one alarm is processed at a time
    alarm_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(actor_id: ActorId, driver: SharedActorDriver, clock: SharedClock) -> Self {
        Self {
            actor_id,
            driver,
            clock,
            index_lock: Mutex::new(()),
            alarm_lock: Mutex::new(()),
        }
    }

    /// Run `fn_name` after `duration_ms` milliseconds. Returns the event id.
    pub async fn after(
        &self,
        duration_ms: i64,
        fn_name: &str,
        args: Vec<Value>,
    ) -> Result<String, ActorError> {
        let timestamp = self.clock.now_ms() + duration_ms;
        self.schedule_event(timestamp, fn_name, args).await
    }

    /// Run `fn_name` at `timestamp_ms` (unix milliseconds). Returns the event id.
    pub async fn at(
        &self,
        timestamp_ms: i64,
        fn_name: &str,
        args: Vec<Value>,
    ) -> Result<String, ActorError> {
        self.schedule_event(timestamp_ms, fn_name, args).await
    }

    async fn schedule_event(
        &self,
        timestamp: i64,
        fn_name: &str,
        args: Vec<Value>,
    ) -> Result<String, ActorError> {
        let event_id = generate_message_id();
        let event = ScheduledEvent {
            event_id: event_id.clone(),
            timestamp,
            fn_name: fn_name.to_string(),
            args,
        };
        self.driver
            .kv_put(&self.actor_id, &event_key(&event_id), to_bytes(&event)?)
            .await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;

        // Ties keep insertion order
        let position = index.partition_point(|entry| entry.timestamp <= timestamp);
        index.insert(
            position,
            ScheduleIndexEntry {
                timestamp,
                event_id: event_id.clone(),
            },
        );
        self.write_index(&index).await?;

        if position == 0 {
            self.driver.set_alarm(&self.actor_id, timestamp).await?;
        }

        debug!(
            "Scheduled {} for actor {} at {} ({} pending)",
            fn_name,
            self.actor_id,
            timestamp,
            index.len()
        );
        Ok(event_id)
    }

    /// Process every due event.
    ///
    /// Due events are removed from storage before any of them runs, then
    /// invoked in timestamp order. A failing event is recorded under its
    /// function's error key and does not stop the rest.
    pub async fn on_alarm(&self, invoker: &dyn EventInvoker) -> Result<AlarmReport, ActorError> {
        let _alarm_guard = self.alarm_lock.lock().await;
        let now = self.clock.now_ms();

        let due_events = {
            let _guard = self.index_lock.lock().await;
            let mut index = self.read_index().await?;

            // Inclusive: an event scheduled for exactly `now` is due, so an alarm
            // firing on time never re-arms for an event it should have run
            let due_count = index.partition_point(|entry| entry.timestamp <= now);
            let due: Vec<ScheduleIndexEntry> = index.drain(..due_count).collect();

            let keys: Vec<String> = due.iter().map(|entry| event_key(&entry.event_id)).collect();
            let records = if keys.is_empty() {
                Vec::new()
            } else {
                self.driver.kv_get_batch(&self.actor_id, &keys).await?
            };

            if !keys.is_empty() {
                self.driver.kv_delete_batch(&self.actor_id, &keys).await?;
                self.write_index(&index).await?;
            }

            match index.first() {
                Some(next) => self.driver.set_alarm(&self.actor_id, next.timestamp).await?,
                None => self.driver.clear_alarm(&self.actor_id).await?,
            }

            let mut events = Vec::with_capacity(records.len());
            for (entry, record) in due.iter().zip(records) {
                match record {
                    Some(bytes) => match serde_json::from_slice::<ScheduledEvent>(&bytes) {
                        Ok(event) => events.push(event),
                        Err(e) => error!("Corrupt scheduled event {}: {}", entry.event_id, e),
                    },
                    None => warn!(
                        "Scheduled event {} for actor {} is missing, skipping",
                        entry.event_id, self.actor_id
                    ),
                }
            }
            events
        };

        let mut report = AlarmReport::default();
        for event in due_events {
            debug!("Running scheduled event {} ({})", event.event_id, event.fn_name);
            match invoker.invoke_event(&event.fn_name, event.args.clone()).await {
                Ok(()) => report.executed.push(event.event_id),
                Err(e) => {
                    error!(
                        "Scheduled event {} ({}) for actor {} failed: {}",
                        event.event_id, event.fn_name, self.actor_id, e
                    );
                    let record = ScheduleErrorRecord {
                        event_id: event.event_id.clone(),
                        fn_name: event.fn_name.clone(),
                        args: event.args,
                        scheduled_at: event.timestamp,
                        failed_at: self.clock.now_ms(),
                        error: e.serialize(true),
                    };
                    if let Err(e) = self.write_error(&record).await {
                        error!("Failed to persist schedule error for {}: {}", record.fn_name, e);
                    }
                    report.failed.push(event.event_id);
                }
            }
        }

        Ok(report)
    }

    /// Re-arm the alarm for the earliest pending event. Called when an
    /// instance starts.
    pub async fn restore_alarm(&self) -> Result<(), ActorError> {
        let _guard = self.index_lock.lock().await;
        if let Some(first) = self.read_index().await?.first() {
            self.driver.set_alarm(&self.actor_id, first.timestamp).await?;
        }
        Ok(())
    }

    /// Pending events in firing order.
    pub async fn pending(&self) -> Result<Vec<ScheduleIndexEntry>, ActorError> {
        self.read_index().await
    }

    pub async fn last_error(&self, fn_name: &str) -> Result<Option<ScheduleErrorRecord>, ActorError> {
        match self.driver.kv_get(&self.actor_id, &error_key(fn_name)).await? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_index(&self) -> Result<Vec<ScheduleIndexEntry>, ActorError> {
        match self.driver.kv_get(&self.actor_id, SCHEDULE_INDEX_KEY).await? {
            Some(bytes) => from_bytes(&bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, index: &[ScheduleIndexEntry]) -> Result<(), ActorError> {
        self.driver
            .kv_put(&self.actor_id, SCHEDULE_INDEX_KEY, to_bytes(&index)?)
            .await?;
        Ok(())
    }

    async fn write_error(&self, record: &ScheduleErrorRecord) -> Result<(), ActorError> {
        self.driver
            .kv_put(&self.actor_id, &error_key(&record.fn_name), to_bytes(record)?)
            .await?;
        Ok(())
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ActorError> {
    serde_json::to_vec(value).map_err(ActorError::internal)
}

fn from_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ActorError> {
    serde_json::from_slice(bytes).map_err(ActorError::internal)
}
