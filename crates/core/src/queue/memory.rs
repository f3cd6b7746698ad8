use super::{JobOutcome, JobTicket, JobWorker, NewJob, QueueBroker, QueuedJob};
use crate::error::{JobError, Result};
use crate::types::JobId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Inactive,
    Active,
    Complete,
    Failed,
}

/// Inspectable view of a job held by the broker
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub id: JobId,
    pub topic: String,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Delivery {
    id: JobId,
    topic: String,
    payload: Value,
    ttl: Option<Duration>,
    attempts: u32,
    remove_on_complete: bool,
    outcome: oneshot::Sender<JobOutcome>,
}

struct Topic {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    jobs: Mutex<HashMap<JobId, JobState>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn update_job<F: FnOnce(&mut JobState)>(&self, id: &JobId, f: F) {
        if let Some(state) = lock(&self.jobs).get_mut(id) {
            f(state);
            state.updated_at = Utc::now();
        }
    }

    /// Deliver one job until it completes or runs out of attempts
    async fn run(&self, delivery: Delivery, worker: &dyn JobWorker) {
        let attempts = delivery.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.update_job(&delivery.id, |s| {
                s.status = JobStatus::Active;
                s.attempts_made = attempt;
            });

            let job = QueuedJob {
                id: delivery.id,
                topic: delivery.topic.clone(),
                payload: delivery.payload.clone(),
                attempt,
            };

            let result = match delivery.ttl {
                Some(ttl) => match tokio::time::timeout(ttl, worker.handle(job)).await {
                    Ok(result) => result,
                    Err(_) => Err(JobError::StepTimeout {
                        ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                    }),
                },
                None => worker.handle(job).await,
            };

            match result {
                Ok(value) => {
                    tracing::debug!("Job {} on {} completed", delivery.id, delivery.topic);
                    if delivery.remove_on_complete {
                        lock(&self.jobs).remove(&delivery.id);
                    } else {
                        self.update_job(&delivery.id, |s| {
                            s.status = JobStatus::Complete;
                            s.result = Some(value.clone());
                        });
                    }
                    let _ = delivery.outcome.send(JobOutcome::Completed(value));
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        tracing::info!(
                            "Redelivering job {} on {} after error: {} (attempt {})",
                            delivery.id,
                            delivery.topic,
                            last_error,
                            attempt + 1
                        );
                    }
                }
            }
        }

        tracing::warn!(
            "Job {} on {} failed after {} attempt(s): {}",
            delivery.id,
            delivery.topic,
            attempts,
            last_error
        );
        self.update_job(&delivery.id, |s| {
            s.status = JobStatus::Failed;
            s.error = Some(last_error.clone());
        });
        let _ = delivery.outcome.send(JobOutcome::Failed(last_error));
    }
}

/// In-process broker built on tokio channels.
///
/// Each topic is a FIFO channel shared by its workers. Must be used from
/// within a tokio runtime.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a job; `None` once removed on completion
    pub fn job(&self, id: &JobId) -> Option<JobState> {
        lock(&self.inner.jobs).get(id).cloned()
    }

    /// Number of live workers registered on `topic`
    pub fn worker_count(&self, topic: &str) -> usize {
        lock(&self.inner.topics)
            .get(topic)
            .map(|t| t.workers.iter().filter(|w| !w.is_finished()).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl QueueBroker for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobTicket> {
        let id = JobId::new();
        let (tx, rx) = oneshot::channel();
        let now = Utc::now();

        lock(&self.inner.jobs).insert(
            id,
            JobState {
                id,
                topic: job.topic.clone(),
                status: JobStatus::Inactive,
                attempts_made: 0,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );

        let delivery = Delivery {
            id,
            topic: job.topic.clone(),
            payload: job.payload,
            ttl: job.ttl,
            attempts: job.attempts,
            remove_on_complete: job.remove_on_complete,
            outcome: tx,
        };

        let sent = lock(&self.inner.topics)
            .entry(job.topic.clone())
            .or_insert_with(Topic::new)
            .sender
            .send(delivery);

        if sent.is_err() {
            lock(&self.inner.jobs).remove(&id);
            return Err(JobError::Submission(format!(
                "topic {} is not accepting jobs",
                job.topic
            )));
        }

        tracing::debug!("Enqueued job {} on {}", id, job.topic);
        Ok(JobTicket::new(id, rx))
    }

    fn process(&self, topic: &str, concurrency: usize, worker: Arc<dyn JobWorker>) -> Result<()> {
        if concurrency == 0 {
            return Err(JobError::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let mut topics = lock(&self.inner.topics);
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);

        for _ in 0..concurrency {
            let receiver = entry.receiver.clone();
            let inner = self.inner.clone();
            let worker = worker.clone();

            let handle = tokio::spawn(async move {
                loop {
                    let delivery = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match delivery {
                        Some(delivery) => inner.run(delivery, worker.as_ref()).await,
                        None => break,
                    }
                }
            });
            entry.workers.push(handle);
        }

        tracing::debug!("Registered {} worker(s) on {}", concurrency, topic);
        Ok(())
    }

    fn shutdown(&self, topic: &str) {
        if let Some(removed) = lock(&self.inner.topics).remove(topic) {
            for worker in &removed.workers {
                worker.abort();
            }
            tracing::debug!("Shut down {} worker(s) on {}", removed.workers.len(), topic);
        }
    }
}
