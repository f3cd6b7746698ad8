use super::SagaContext;
use crate::error::{JobError, Result};
use crate::events::EventType;
use crate::queue::{JobOutcome, NewJob};
use crate::storage::{RecordStore, WriteBatch};
use crate::types::{field, InstanceId, TaskRecord, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Queue payload of one step delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepJob {
    pub record: TaskRecord,
    pub pre_result: Option<Value>,
}

/// Read the step record at `idx`; `None` if the slot is empty
pub async fn load_record(
    store: &dyn RecordStore,
    instance: &InstanceId,
    idx: u64,
) -> Result<Option<TaskRecord>> {
    let key = instance.step_key(idx);
    let fields = store.hash_get_all(&key).await?;
    TaskRecord::from_fields(&key, &fields)
}

/// Every record of an instance from index 0 up to the first empty slot
pub async fn read_chain(store: &dyn RecordStore, instance: &InstanceId) -> Result<Vec<TaskRecord>> {
    let mut records = Vec::new();
    let mut idx = 0;
    while let Some(record) = load_record(store, instance, idx).await? {
        records.push(record);
        idx += 1;
    }
    Ok(records)
}

/// Advances an instance through its chain one queued step at a time.
///
/// Step `idx + 1` is only looked up after step `idx` is durably terminal,
/// so at most one record per instance is ever in flight.
pub struct Stepper {
    ctx: SagaContext,
}

impl Stepper {
    pub fn new(ctx: SagaContext) -> Self {
        Self { ctx }
    }

    pub async fn load(&self, instance: &InstanceId, idx: u64) -> Result<Option<TaskRecord>> {
        load_record(self.ctx.store.as_ref(), instance, idx).await
    }

    /// Run the chain starting at `start`, feeding each result into the next
    /// step. Resolves with the last step's result; an empty slot at `start`
    /// ends the chain with `pre_result`.
    pub async fn create_step(
        &self,
        instance: &InstanceId,
        start: u64,
        pre_result: Option<Value>,
    ) -> Result<Value> {
        let mut idx = start;
        let mut pre_result = pre_result;

        loop {
            let Some(mut record) = self.load(instance, idx).await? else {
                tracing::debug!("No step at {}, chain finished", instance.step_key(idx));
                return Ok(pre_result.unwrap_or(Value::Null));
            };

            let result = match record.status {
                TaskStatus::Complete => {
                    tracing::debug!("Step {} already complete", instance.step_key(idx));
                    record.result.unwrap_or(Value::Null)
                }
                TaskStatus::Failed => {
                    return Err(JobError::Step {
                        message: record.error.unwrap_or_default(),
                        index: idx,
                    });
                }
                TaskStatus::Pending => self.dispatch(instance, idx, &mut record, pre_result.take()).await?,
            };

            match self.next_index(instance, idx).await? {
                Some(next) => {
                    idx = next;
                    pre_result = Some(result);
                }
                None => return Ok(result),
            }
        }
    }

    /// Index of the step following `idx`, if its slot holds a record
    async fn next_index(&self, instance: &InstanceId, idx: u64) -> Result<Option<u64>> {
        let Some(next) = self.load(instance, idx + 1).await? else {
            return Ok(None);
        };
        if next.idx <= idx {
            return Err(JobError::InvalidRecord {
                key: instance.step_key(idx + 1),
                reason: format!("idx {} does not advance past {}", next.idx, idx),
            });
        }
        Ok(Some(next.idx))
    }

    /// Queue one step and persist its terminal outcome
    async fn dispatch(
        &self,
        instance: &InstanceId,
        idx: u64,
        record: &mut TaskRecord,
        pre_result: Option<Value>,
    ) -> Result<Value> {
        let key = instance.step_key(idx);

        if let Some(input) = &pre_result {
            let fields = HashMap::from([(field::PRE_RESULT.to_string(), input.to_string())]);
            self.ctx.store.hash_set_multi(&key, &fields).await?;
            record.pre_result = Some(input.clone());
        }

        tracing::debug!(
            "Queueing step {} ({}) handler={} rewind={}",
            key,
            record.name,
            record.dispatch_ref(),
            record.rewind_flag
        );

        let payload = serde_json::to_value(StepJob {
            record: record.clone(),
            pre_result,
        })?;
        let job = NewJob::new(instance.as_str(), payload)
            .attempts(record.retry_limit)
            .ttl(record.ttl_ms.map(Duration::from_millis))
            .remove_on_complete(self.ctx.remove_on_complete);
        let ticket = self.ctx.queue.enqueue(job).await?;

        match ticket.outcome().await {
            JobOutcome::Completed(result) => {
                let mut batch = WriteBatch::new();
                batch
                    .hash_set(&key, field::STATUS, TaskStatus::Complete.as_str())
                    .hash_set(&key, field::RESULT, result.to_string());
                self.ctx.store.commit(batch).await?;

                tracing::debug!("Step {} complete", key);
                self.ctx.events.publish(EventType::StepCompleted {
                    instance_id: instance.clone(),
                    index: idx,
                    rewind: record.rewind_flag,
                });
                Ok(result)
            }
            JobOutcome::Failed(message) => {
                let mut batch = WriteBatch::new();
                batch
                    .hash_set(&key, field::STATUS, TaskStatus::Failed.as_str())
                    .hash_set(&key, field::ERROR, message.clone());
                self.ctx.store.commit(batch).await?;

                tracing::warn!("Step {} failed: {}", key, message);
                self.ctx.events.publish(EventType::StepFailed {
                    instance_id: instance.clone(),
                    index: idx,
                    rewind: record.rewind_flag,
                    error: message.clone(),
                });
                Err(JobError::Step {
                    message,
                    index: idx,
                })
            }
        }
    }
}
