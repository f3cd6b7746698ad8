// Job submission, per-type consumption loops and outcome persistence

use crate::config::{EngineConfig, SubmitOptions};
use crate::error::{JobError, Result};
use crate::events::{Event, EventBus, EventType};
use crate::handler::HandlerRegistry;
use crate::queue::{JobOutcome, JobWorker, NewJob, QueueBroker, QueuedJob};
use crate::saga::{load_record, read_chain, SagaContext, TaskSeries};
use crate::storage::{RecordStore, WriteBatch};
use crate::types::{
    encode_value, HeadJobPayload, InstanceId, JobId, JobKey, TaskDefinition, TaskRecord,
    INIT_SENTINEL,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Handle returned by a successful submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    /// Caller-facing key holding the sentinel, job id and finally the result
    pub key: JobKey,
    /// Broker id of the head job
    pub job_id: JobId,
}

/// Public entry point of the engine
pub struct JobManager {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn QueueBroker>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    config: EngineConfig,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn QueueBroker>,
        handlers: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            handlers: Arc::new(handlers),
            events: EventBus::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Submit a job using the configured defaults
    pub async fn submit(
        &self,
        job_type: &str,
        data: Value,
        tasks: Vec<TaskDefinition>,
    ) -> Result<SubmittedJob> {
        self.submit_with(job_type, data, tasks, self.config.submit_options())
            .await
    }

    /// Submit a job.
    ///
    /// Writes the `init` sentinel under the job key, enqueues the head job on
    /// topic `job_type` and then replaces the sentinel with the broker job id.
    /// The result is written under the same key once the saga succeeds.
    pub async fn submit_with(
        &self,
        job_type: &str,
        data: Value,
        tasks: Vec<TaskDefinition>,
        options: SubmitOptions,
    ) -> Result<SubmittedJob> {
        validate_job_type(job_type)?;
        let unique_id = unique_value(&data, &options.uniq_field)?;
        let key = JobKey::new(job_type, &options.uniq_field, &unique_id);

        self.store.set(key.as_str(), INIT_SENTINEL).await?;

        let payload = HeadJobPayload {
            data,
            unique_id,
            tasks,
        };
        let job = NewJob::new(job_type, serde_json::to_value(&payload)?)
            .ttl(Some(options.job_ttl))
            .attempts(1)
            .remove_on_complete(self.config.remove_on_complete());

        let ticket = match self.queue.enqueue(job).await {
            Ok(ticket) => ticket,
            Err(e) => {
                if let Err(cleanup) = self.store.delete(key.as_str()).await {
                    tracing::warn!("Failed to remove sentinel {}: {}", key, cleanup);
                }
                let reason = match e {
                    JobError::Submission(reason) => reason,
                    other => other.to_string(),
                };
                return Err(JobError::Submission(reason));
            }
        };

        // The head job is enqueued from here on; its outcome must still be watched
        let job_id = ticket.id;
        match self.store.set(key.as_str(), &job_id.to_string()).await {
            Ok(()) => tracing::info!("Submitted job {} as {}", key, job_id),
            Err(e) => tracing::warn!("Submitted job {} as {} but failed to record its id: {}", key, job_id, e),
        }

        let store = self.store.clone();
        let events = self.events.clone();
        let watched = key.clone();
        let expiry = options.result_expiry();
        tokio::spawn(async move {
            match ticket.outcome().await {
                JobOutcome::Completed(result) => {
                    let encoded = encode_value(&result);
                    let stored = match expiry {
                        Some(ttl) => store.set_with_expiry(watched.as_str(), ttl, &encoded).await,
                        None => store.set(watched.as_str(), &encoded).await,
                    };
                    if let Err(e) = stored {
                        tracing::error!("Failed to persist result of {}: {}", watched, e);
                    }
                    tracing::info!("Job {} completed", watched);
                    events.publish(EventType::JobCompleted {
                        key: watched,
                        result,
                    });
                }
                JobOutcome::Failed(error) => {
                    tracing::warn!("Job {} failed: {}", watched, error);
                    events.publish(EventType::JobFailed { key: watched, error });
                }
            }
        });

        Ok(SubmittedJob { key, job_id })
    }

    /// Start `concurrency` head-job workers for `job_type`.
    ///
    /// The returned lane yields the instance id of every job as it starts;
    /// the final result is read back from the job key.
    pub fn run(&self, job_type: &str, concurrency: usize) -> Result<JobLane> {
        validate_job_type(job_type)?;

        // Subscribe first so no start event is missed
        let lane = JobLane {
            job_type: job_type.to_string(),
            events: self.events.subscribe(),
        };

        let mut ctx = SagaContext::new(
            self.store.clone(),
            self.queue.clone(),
            self.handlers.clone(),
            self.events.clone(),
        );
        ctx.remove_on_complete = self.config.remove_on_complete();

        let worker = Arc::new(HeadJobWorker {
            job_type: job_type.to_string(),
            ctx,
        });
        self.queue.process(job_type, concurrency, worker)?;

        tracing::info!("Running {} with concurrency {}", job_type, concurrency);
        Ok(lane)
    }

    /// Stop the workers of `job_type`
    pub fn stop(&self, job_type: &str) {
        self.queue.shutdown(job_type);
        tracing::info!("Stopped {}", job_type);
    }

    /// Current value of a job key: `init`, the broker job id, or the result
    pub async fn job_record(
        &self,
        job_type: &str,
        uniq_field: &str,
        value: &str,
    ) -> Result<Option<String>> {
        let key = JobKey::new(job_type, uniq_field, value);
        Ok(self.store.get(key.as_str()).await?)
    }

    /// Every step record of an instance, forward steps then compensations
    pub async fn task_records(&self, instance: &InstanceId) -> Result<Vec<TaskRecord>> {
        read_chain(self.store.as_ref(), instance).await
    }
}

/// Start notifications of one job type
pub struct JobLane {
    job_type: String,
    events: broadcast::Receiver<Event>,
}

impl JobLane {
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Wait for the next instance of this job type to start executing
    pub async fn next_instance(&mut self) -> Option<InstanceId> {
        loop {
            match self.events.recv().await {
                Ok(Event {
                    event_type: EventType::JobStarted {
                        job_type,
                        instance_id,
                    },
                    ..
                }) if job_type == self.job_type => return Some(instance_id),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("{} lane skipped {} events", self.job_type, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Materializes the task plan and hands the instance to a [`TaskSeries`]
struct HeadJobWorker {
    job_type: String,
    ctx: SagaContext,
}

#[async_trait::async_trait]
impl JobWorker for HeadJobWorker {
    async fn handle(&self, job: QueuedJob) -> Result<Value> {
        let payload: HeadJobPayload = serde_json::from_value(job.payload)?;
        if payload.tasks.is_empty() {
            tracing::debug!("Job {} has no tasks", job.id);
            return Ok(Value::Null);
        }

        let instance = InstanceId::new(&self.job_type, &payload.unique_id);

        if load_record(self.ctx.store.as_ref(), &instance, 0).await?.is_some() {
            tracing::info!("Resuming {} from persisted records", instance);
        } else {
            let mut batch = WriteBatch::new();
            for (idx, task) in payload.tasks.iter().enumerate() {
                let idx = idx as u64;
                let record = TaskRecord::from_definition(task, idx)?;
                batch.hash_set_multi(instance.step_key(idx), record.to_fields());
            }
            self.ctx.store.commit(batch).await?;
            tracing::debug!("Materialized {} step(s) for {}", payload.tasks.len(), instance);
        }

        self.ctx.events.publish(EventType::JobStarted {
            job_type: self.job_type.clone(),
            instance_id: instance.clone(),
        });

        TaskSeries::new(self.ctx.clone()).execute(&instance).await
    }
}

fn validate_job_type(job_type: &str) -> Result<()> {
    if job_type.trim().is_empty() {
        return Err(JobError::Validation(
            "job type must be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

/// The unique field of `data` rendered as a key segment
fn unique_value(data: &Value, field: &str) -> Result<String> {
    let Some(object) = data.as_object() else {
        return Err(JobError::Validation("job data must be an object".to_string()));
    };

    match object.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(true)) => Ok("true".to_string()),
        _ => Err(JobError::Validation(format!(
            "data.{} must be present and non-empty",
            field
        ))),
    }
}
