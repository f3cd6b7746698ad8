use super::rewind::Rewinder;
use super::stepper::{StepJob, Stepper};
use super::SagaContext;
use crate::error::{JobError, Result};
use crate::handler::HandlerRegistry;
use crate::queue::{JobWorker, QueueBroker, QueuedJob};
use crate::types::InstanceId;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Coordinates one saga instance: forward chain first, compensation on failure.
///
/// Step jobs are queued on a topic named after the instance and processed by
/// a dedicated single worker that lives only as long as [`TaskSeries::execute`].
pub struct TaskSeries {
    ctx: SagaContext,
    stepper: Stepper,
    rewinder: Rewinder,
}

impl TaskSeries {
    pub fn new(ctx: SagaContext) -> Self {
        let stepper = Stepper::new(ctx.clone());
        let rewinder = Rewinder::new(ctx.clone());
        Self {
            ctx,
            stepper,
            rewinder,
        }
    }

    /// Run the instance's chain from index 0.
    ///
    /// On a step failure the compensation chain runs to completion before
    /// this returns, and the result is always the original step error.
    pub async fn execute(&self, instance: &InstanceId) -> Result<Value> {
        let worker = Arc::new(StepWorker::new(self.ctx.handlers.clone()));
        self.ctx.queue.process(instance.as_str(), 1, worker)?;
        let _topic = TopicGuard {
            queue: self.ctx.queue.clone(),
            topic: instance.to_string(),
        };

        tracing::info!("Executing task series {}", instance);

        match self.stepper.create_step(instance, 0, None).await {
            Ok(result) => {
                tracing::info!("Task series {} complete", instance);
                Ok(result)
            }
            Err(JobError::Step { message, index }) => {
                tracing::warn!("Task series {} failed at step {}: {}", instance, index, message);

                match self.rewinder.rewind(instance, index).await {
                    Ok(None) => {}
                    Ok(Some(_)) => tracing::info!("Compensation of {} finished", instance),
                    Err(e) => tracing::error!("Compensation of {} failed: {}", instance, e),
                }

                Err(JobError::Step { message, index })
            }
            Err(e) => Err(e),
        }
    }
}

/// Releases the instance topic's worker when execution ends, however it ends
struct TopicGuard {
    queue: Arc<dyn QueueBroker>,
    topic: String,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        self.queue.shutdown(&self.topic);
        tracing::debug!("Released worker for {}", self.topic);
    }
}

/// Aborts the wrapped task if dropped before it finishes
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Resolves the step's handler and invokes it with the parsed param
pub(crate) struct StepWorker {
    handlers: Arc<HandlerRegistry>,
}

impl StepWorker {
    pub(crate) fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }
}

#[async_trait::async_trait]
impl JobWorker for StepWorker {
    async fn handle(&self, job: QueuedJob) -> Result<Value> {
        let step: StepJob = serde_json::from_value(job.payload)?;
        let handler = self.handlers.get(step.record.dispatch_ref())?;

        let param = if step.record.param.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&step.record.param).map_err(|e| {
                JobError::HandlerExecution(format!("invalid param for {}: {}", step.record.name, e))
            })?
        };

        tracing::debug!(
            "Invoking {} for {}:{} (attempt {})",
            step.record.dispatch_ref(),
            job.topic,
            step.record.idx,
            job.attempt
        );

        // Handler runs in its own task so a ttl expiry can cancel it
        let mut task = AbortOnDrop(tokio::spawn(async move {
            handler.invoke(param, step.pre_result).await
        }));

        match (&mut task.0).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(JobError::HandlerExecution(format!("{:#}", e))),
            Err(e) if e.is_panic() => Err(JobError::HandlerExecution("handler panicked".to_string())),
            Err(e) => Err(JobError::HandlerExecution(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::queue::MemoryQueue;
    use crate::saga::read_chain;
    use crate::storage::{MemoryRecordStore, RecordStore, WriteBatch};
    use crate::types::{TaskDefinition, TaskRecord, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        queue: MemoryQueue,
        series: TaskSeries,
        invocations: Arc<AtomicUsize>,
        compensations: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let invocations = Arc::new(AtomicUsize::new(0));
        let compensations = Arc::new(AtomicUsize::new(0));

        let mut handlers = HandlerRegistry::new();
        let calls = invocations.clone();
        handlers.register("task1", move |param: Value, _prev: Option<Value>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(param["foo"].clone())
            }
        });
        handlers.register("task2", |param: Value, prev: Option<Value>| async move {
            let prev = prev.and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            let suffix = param["baz"].as_str().unwrap_or_default().to_string();
            Ok::<_, anyhow::Error>(Value::String(format!("{}{}", prev, suffix)))
        });
        handlers.register("failTask", |_param: Value, _prev: Option<Value>| async move {
            Err::<Value, _>(anyhow::anyhow!("boom"))
        });
        let undone = compensations.clone();
        handlers.register("rewindTask", move |_param: Value, prev: Option<Value>| {
            let undone = undone.clone();
            async move {
                undone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!({ "undone": prev }))
            }
        });

        let store = Arc::new(MemoryRecordStore::new());
        let queue = MemoryQueue::new();
        let ctx = SagaContext::new(
            store.clone(),
            Arc::new(queue.clone()),
            Arc::new(handlers),
            EventBus::default(),
        );

        Fixture {
            store,
            queue,
            series: TaskSeries::new(ctx),
            invocations,
            compensations,
        }
    }

    async fn materialize(store: &MemoryRecordStore, instance: &InstanceId, tasks: &[TaskDefinition]) {
        let mut batch = WriteBatch::new();
        for (idx, task) in tasks.iter().enumerate() {
            let record = TaskRecord::from_definition(task, idx as u64).unwrap();
            batch.hash_set_multi(instance.step_key(idx as u64), record.to_fields());
        }
        store.commit(batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_results_flow_between_steps() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-1");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("first", "task1").param(json!({"foo": "bar"})),
                TaskDefinition::new("second", "task2").param(json!({"baz": "qux"})),
            ],
        )
        .await;

        let result = fx.series.execute(&instance).await.unwrap();
        assert_eq!(result, json!("barqux"));

        let records = read_chain(fx.store.as_ref(), &instance).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == TaskStatus::Complete));
        assert_eq!(records[0].result, Some(json!("bar")));
        assert_eq!(records[1].pre_result, Some(json!("bar")));
        assert_eq!(records[1].result, Some(json!("barqux")));
    }

    #[tokio::test]
    async fn test_failure_without_compensation() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-2");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("first", "task1").param(json!({"foo": "bar"})),
                TaskDefinition::new("broken", "failTask"),
                TaskDefinition::new("never", "task2"),
            ],
        )
        .await;

        let err = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(err.step_index(), Some(1));
        assert!(err.to_string().contains("boom"));

        let records = read_chain(fx.store.as_ref(), &instance).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, TaskStatus::Complete);
        assert_eq!(records[1].status, TaskStatus::Failed);
        assert_eq!(records[2].status, TaskStatus::Pending);
        assert!(records.iter().all(|r| !r.rewind_flag));
    }

    #[tokio::test]
    async fn test_failure_runs_compensation_after_failure_point() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-3");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("reserve", "task1")
                    .param(json!({"foo": "bar"}))
                    .compensate_with("rewindTask"),
                TaskDefinition::new("charge", "task2").param(json!({"baz": "!"})),
                TaskDefinition::new("ship", "failTask"),
            ],
        )
        .await;

        let err = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(err.step_index(), Some(2));
        assert_eq!(fx.compensations.load(Ordering::SeqCst), 1);

        let records = read_chain(fx.store.as_ref(), &instance).await.unwrap();
        assert_eq!(records.len(), 4);
        let compensation = &records[3];
        assert!(compensation.rewind_flag);
        assert_eq!(compensation.idx, 3);
        assert_eq!(compensation.handler_ref, "rewindTask");
        assert_eq!(compensation.status, TaskStatus::Complete);
        // Seeded with the last forward result before the failure
        assert_eq!(compensation.pre_result, Some(json!("bar!")));
    }

    #[tokio::test]
    async fn test_failed_compensation_keeps_original_error() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-4");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("reserve", "task1")
                    .param(json!({"foo": "bar"}))
                    .compensate_with("failTask"),
                TaskDefinition::new("charge", "failTask"),
            ],
        )
        .await;

        let err = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(err.step_index(), Some(1));

        let records = read_chain(fx.store.as_ref(), &instance).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[2].rewind_flag);
        assert_eq!(records[2].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_completed_steps_are_not_rerun() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-5");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("first", "task1").param(json!({"foo": "bar"})),
                TaskDefinition::new("second", "task2").param(json!({"baz": "qux"})),
            ],
        )
        .await;

        let mut batch = WriteBatch::new();
        batch
            .hash_set(instance.step_key(0), "status", "complete")
            .hash_set(instance.step_key(0), "result", json!("done").to_string());
        fx.store.commit(batch).await.unwrap();

        let result = fx.series.execute(&instance).await.unwrap();
        assert_eq!(result, json!("donequx"));
        assert_eq!(fx.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_slot_ends_the_chain() {
        let fx = fixture();
        let instance = InstanceId::new("order", "nothing");

        let result = fx
            .series
            .stepper
            .create_step(&instance, 5, Some(json!(1)))
            .await
            .unwrap();
        assert_eq!(result, json!(1));

        let result = fx.series.stepper.create_step(&instance, 0, None).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_failed_record_is_not_redispatched() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-9");
        materialize(
            &fx.store,
            &instance,
            &[TaskDefinition::new("first", "task1").param(json!({"foo": "bar"}))],
        )
        .await;

        let mut batch = WriteBatch::new();
        batch
            .hash_set(instance.step_key(0), "status", "failed")
            .hash_set(instance.step_key(0), "error", "earlier crash");
        fx.store.commit(batch).await.unwrap();

        let err = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(err.step_index(), Some(0));
        assert!(err.to_string().contains("earlier crash"));
        assert_eq!(fx.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_numeric_looking_string_reaches_compensation_intact() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-10");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("reserve", "task1")
                    .param(json!({"foo": "42"}))
                    .compensate_with("rewindTask"),
                TaskDefinition::new("charge", "failTask"),
            ],
        )
        .await;

        fx.series.execute(&instance).await.unwrap_err();

        let records = read_chain(fx.store.as_ref(), &instance).await.unwrap();
        assert_eq!(records[0].result, Some(json!("42")));
        assert_eq!(records[2].pre_result, Some(json!("42")));
        assert_eq!(records[2].result, Some(json!({ "undone": "42" })));
    }

    #[tokio::test]
    async fn test_reexecuting_failed_instance_keeps_compensation_done() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-11");
        materialize(
            &fx.store,
            &instance,
            &[
                TaskDefinition::new("reserve", "task1")
                    .param(json!({"foo": "bar"}))
                    .compensate_with("rewindTask"),
                TaskDefinition::new("charge", "failTask"),
            ],
        )
        .await;

        let first = fx.series.execute(&instance).await.unwrap_err();
        let second = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(first.step_index(), Some(1));
        assert_eq!(second.step_index(), Some(1));

        assert_eq!(fx.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(fx.compensations.load(Ordering::SeqCst), 1);

        let records = read_chain(fx.store.as_ref(), &instance).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_the_step() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-6");
        materialize(&fx.store, &instance, &[TaskDefinition::new("ghost", "nope")]).await;

        let err = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(err.step_index(), Some(0));
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_step_worker_released_after_execution() {
        let fx = fixture();
        let instance = InstanceId::new("order", "o-7");
        materialize(
            &fx.store,
            &instance,
            &[TaskDefinition::new("first", "task1").param(json!({"foo": 1}))],
        )
        .await;

        fx.series.execute(&instance).await.unwrap();
        assert_eq!(fx.queue.worker_count(instance.as_str()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_ttl_counts_as_failure() {
        let mut fx = fixture();
        let mut handlers = HandlerRegistry::new();
        handlers.register("slow", |_param: Value, _prev: Option<Value>| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(Value::Null)
        });
        let ctx = SagaContext::new(
            fx.store.clone(),
            Arc::new(fx.queue.clone()),
            Arc::new(handlers),
            EventBus::default(),
        );
        fx.series = TaskSeries::new(ctx);

        let instance = InstanceId::new("order", "o-8");
        materialize(
            &fx.store,
            &instance,
            &[TaskDefinition::new("slow", "slow").ttl(Duration::from_millis(200))],
        )
        .await;

        let err = fx.series.execute(&instance).await.unwrap_err();
        assert_eq!(err.step_index(), Some(0));
        assert!(err.to_string().contains("timed out"));
    }
}
