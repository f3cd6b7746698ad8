use crate::types::{InstanceId, JobKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A lifecycle event published by the job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur while jobs run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Job lifecycle events
    /// Step records were materialized and the saga is about to start
    JobStarted {
        job_type: String,
        instance_id: InstanceId,
    },
    /// The saga succeeded and its result was persisted under `key`
    JobCompleted {
        key: JobKey,
        result: serde_json::Value,
    },
    JobFailed {
        key: JobKey,
        error: String,
    },

    // Step lifecycle events
    StepCompleted {
        instance_id: InstanceId,
        index: u64,
        rewind: bool,
    },
    StepFailed {
        instance_id: InstanceId,
        index: u64,
        rewind: bool,
        error: String,
    },

    // Compensation events
    RewindScheduled {
        instance_id: InstanceId,
        failed_index: u64,
        steps: Vec<u64>,
    },
    RewindFinished {
        instance_id: InstanceId,
        failed_index: u64,
        error: Option<String>,
    },
}

/// Fan-out channel for [`Event`]s. Publishing without subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event_type: EventType) {
        // No receivers is fine
        let _ = self.sender.send(Event::new(event_type));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
