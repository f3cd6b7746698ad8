// Saga execution: step chain, compensation and the per-instance coordinator

pub mod rewind;
pub mod series;
pub mod stepper;

pub use rewind::Rewinder;
pub use series::TaskSeries;
pub use stepper::{load_record, read_chain, Stepper};

use crate::events::EventBus;
use crate::handler::HandlerRegistry;
use crate::queue::QueueBroker;
use crate::storage::RecordStore;
use std::sync::Arc;

/// Collaborators shared by every saga component
#[derive(Clone)]
pub struct SagaContext {
    pub store: Arc<dyn RecordStore>,
    pub queue: Arc<dyn QueueBroker>,
    pub handlers: Arc<HandlerRegistry>,
    pub events: EventBus,
    /// Drop step jobs from the broker once they complete
    pub remove_on_complete: bool,
}

impl SagaContext {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn QueueBroker>,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            handlers,
            events,
            remove_on_complete: true,
        }
    }
}
