use super::stepper::Stepper;
use super::SagaContext;
use crate::error::Result;
use crate::events::EventType;
use crate::storage::WriteBatch;
use crate::types::{InstanceId, TaskRecord};
use futures::future::try_join_all;
use serde_json::Value;

/// Schedules and runs compensation after a forward step fails.
///
/// Compensation records are appended after the failure point in reverse
/// plan order and executed through the regular [`Stepper`].
pub struct Rewinder {
    ctx: SagaContext,
    stepper: Stepper,
}

impl Rewinder {
    pub fn new(ctx: SagaContext) -> Self {
        let stepper = Stepper::new(ctx.clone());
        Self { ctx, stepper }
    }

    /// Compensate the steps at `failed_index` and below.
    ///
    /// Resolves with `None` when no step declares a compensating handler,
    /// otherwise with the outcome of the compensation chain. Compensation
    /// already scheduled by an earlier run is resumed, never rescheduled.
    pub async fn rewind(&self, instance: &InstanceId, failed_index: u64) -> Result<Option<Value>> {
        tracing::info!("Rewinding {} from step {}", instance, failed_index);

        // Newest first
        let reads = (0..=failed_index)
            .rev()
            .map(|idx| self.stepper.load(instance, idx));
        let records: Vec<Option<TaskRecord>> = try_join_all(reads).await?;

        // Last completed forward result, read from just before the failure point
        let seed = records
            .get(1)
            .and_then(|r| r.as_ref())
            .and_then(|r| r.result.clone());

        if let Some(next) = self.stepper.load(instance, failed_index + 1).await? {
            if next.rewind_flag {
                tracing::info!("Compensation of {} already scheduled, resuming", instance);
                return self.compensate(instance, failed_index, seed).await.map(Some);
            }
        }

        let mut cursor = failed_index;
        let mut scheduled = Vec::new();
        let mut batch = WriteBatch::new();

        for record in records.iter().flatten() {
            if let Some(compensation) = record.to_compensation(cursor + 1) {
                cursor += 1;
                let key = instance.step_key(cursor);
                // Replace whatever forward record sat in the slot
                batch
                    .delete(key.clone())
                    .hash_set_multi(key, compensation.to_fields());
                scheduled.push(cursor);
            }
        }

        if scheduled.is_empty() {
            self.ctx.store.commit(batch).await?;
            tracing::info!("No compensation needed for {}", instance);
            return Ok(None);
        }

        // Cut off any forward continuation right after the last compensation
        batch.delete(instance.step_key(cursor + 1));
        self.ctx.store.commit(batch).await?;

        tracing::info!(
            "Scheduled {} compensation step(s) for {} at {:?}",
            scheduled.len(),
            instance,
            scheduled
        );
        self.ctx.events.publish(EventType::RewindScheduled {
            instance_id: instance.clone(),
            failed_index,
            steps: scheduled,
        });

        self.compensate(instance, failed_index, seed).await.map(Some)
    }

    /// Run the compensation chain that starts right after `failed_index`
    async fn compensate(
        &self,
        instance: &InstanceId,
        failed_index: u64,
        seed: Option<Value>,
    ) -> Result<Value> {
        let outcome = self
            .stepper
            .create_step(instance, failed_index + 1, seed)
            .await;

        self.ctx.events.publish(EventType::RewindFinished {
            instance_id: instance.clone(),
            failed_index,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });

        outcome
    }
}
