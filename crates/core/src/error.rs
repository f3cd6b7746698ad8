//! Error types for the job engine.

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, JobError>;

/// Error types that can occur while submitting or executing a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Bad submission input. Never retried.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The queue broker failed to persist the head job.
    #[error("Failed to submit job: {0}")]
    Submission(String),

    /// No handler is registered under the requested identifier.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// A handler returned an error or panicked.
    #[error("Handler failed: {0}")]
    HandlerExecution(String),

    /// A queued unit exceeded its ttl.
    #[error("Step timed out after {ttl_ms}ms")]
    StepTimeout { ttl_ms: u64 },

    /// Terminal saga error: the forward step at `index` failed.
    #[error("Step {index} failed: {message}")]
    Step { message: String, index: u64 },

    /// The record store could not complete an operation.
    #[error("Record store unavailable: {0}")]
    Store(#[from] anyhow::Error),

    /// A persisted record could not be decoded.
    #[error("Invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    /// Index of the failed forward step, when this is a saga step failure.
    pub fn step_index(&self) -> Option<u64> {
        match self {
            Self::Step { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether this error was raised by a single step rather than by the
    /// submission path or the store.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::HandlerNotFound(_)
                | Self::HandlerExecution(_)
                | Self::StepTimeout { .. }
                | Self::Step { .. }
        )
    }
}
