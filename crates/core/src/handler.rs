// Step handler contract and registry

use crate::error::{JobError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A forward or compensating step implementation.
///
/// Receives the step's parsed `param` and the previous step's result, if any.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, param: Value, previous: Option<Value>) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, param: Value, previous: Option<Value>) -> anyhow::Result<Value> {
        (self)(param, previous).await
    }
}

/// Handlers keyed by the identifier task definitions refer to
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Resolve a handler at dispatch time
    pub fn get(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::HandlerNotFound(name.to_string()))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
