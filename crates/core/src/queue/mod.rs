//! Queue broker seam.
//!
//! A broker dispatches jobs by topic to registered workers, enforces each
//! job's ttl and delivery attempts, and reports exactly one terminal
//! outcome per job through the [`JobTicket`] returned at enqueue time.

pub mod memory;

pub use memory::{JobState, JobStatus, MemoryQueue};

use crate::error::Result;
use crate::types::JobId;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A job to enqueue
#[derive(Debug, Clone)]
pub struct NewJob {
    pub topic: String,
    pub payload: Value,
    /// Per-attempt deadline
    pub ttl: Option<Duration>,
    /// Maximum delivery attempts
    pub attempts: u32,
    pub remove_on_complete: bool,
}

impl NewJob {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            ttl: None,
            attempts: 1,
            remove_on_complete: true,
        }
    }

    pub fn ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    Failed(String),
}

/// Handle to an enqueued job
#[derive(Debug)]
pub struct JobTicket {
    pub id: JobId,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn new(id: JobId, outcome: oneshot::Receiver<JobOutcome>) -> Self {
        Self { id, outcome }
    }

    /// Wait for the job to complete or fail
    pub async fn outcome(self) -> JobOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            JobOutcome::Failed("job was dropped before reaching a terminal state".to_string())
        })
    }
}

/// One delivery of a job to a worker
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    pub topic: String,
    pub payload: Value,
    /// 1-based delivery attempt
    pub attempt: u32,
}

/// Processes jobs of a topic
#[async_trait::async_trait]
pub trait JobWorker: Send + Sync {
    async fn handle(&self, job: QueuedJob) -> Result<Value>;
}

/// Topic-based job queue
#[async_trait::async_trait]
pub trait QueueBroker: Send + Sync {
    /// Durably accept a job. An error means the job was not saved.
    async fn enqueue(&self, job: NewJob) -> Result<JobTicket>;

    /// Start `concurrency` workers pulling jobs of `topic`
    fn process(&self, topic: &str, concurrency: usize, worker: Arc<dyn JobWorker>) -> Result<()>;

    /// Stop the workers of `topic` and drop its pending jobs
    fn shutdown(&self, topic: &str);
}
