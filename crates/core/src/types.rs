use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Sentinel written under the job key before the head job is saved.
pub const INIT_SENTINEL: &str = "init";

/// Identifier the queue broker assigns to an enqueued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution of a job type for a caller-supplied unique value.
///
/// Formatted as `{jobType}:{uniqueId}`; it doubles as the queue topic for
/// the instance's steps and as the prefix of its step record keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(job_type: &str, unique_id: &str) -> Self {
        Self(format!("{}:{}", job_type, unique_id))
    }

    /// Record store key of the step at `idx`
    pub fn step_key(&self, idx: u64) -> String {
        format!("{}:{}", self.0, idx)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-facing handle under which a job's outcome is persisted.
///
/// Formatted as `{jobType}:{uniqFieldName}:{uniqFieldValue}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey(pub String);

impl JobKey {
    pub fn new(job_type: &str, uniq_field: &str, uniq_value: &str) -> Self {
        Self(format!("{}:{}:{}", job_type, uniq_field, uniq_value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a persisted step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

fn default_retry_limit() -> u32 {
    1
}

/// One step of a submitted job plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub name: String,
    pub handler_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_handler_ref: Option<String>,
    #[serde(default)]
    pub param: Value,
    /// Step timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Maximum delivery attempts
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, handler_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler_ref: handler_ref.into(),
            compensating_handler_ref: None,
            param: Value::Null,
            ttl_ms: None,
            retry_limit: default_retry_limit(),
        }
    }

    pub fn param(mut self, param: Value) -> Self {
        self.param = param;
        self
    }

    /// Register the handler that undoes this step after a later failure
    pub fn compensate_with(mut self, handler_ref: impl Into<String>) -> Self {
        self.compensating_handler_ref = Some(handler_ref.into());
        self
    }

    pub fn ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn retry_limit(mut self, attempts: u32) -> Self {
        self.retry_limit = attempts;
        self
    }
}

/// Head job payload: the caller's data plus the task plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadJobPayload {
    pub data: Value,
    pub unique_id: String,
    pub tasks: Vec<TaskDefinition>,
}

/// Hash field names of a persisted [`TaskRecord`]
pub mod field {
    pub const NAME: &str = "name";
    pub const HANDLER_REF: &str = "handlerRef";
    pub const COMPENSATING_HANDLER_REF: &str = "compensatingHandlerRef";
    pub const PARAM: &str = "param";
    pub const TTL: &str = "ttl";
    pub const RETRY_LIMIT: &str = "retryLimit";
    pub const IDX: &str = "idx";
    pub const STATUS: &str = "status";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const PRE_RESULT: &str = "preResult";
    pub const REWIND_FLAG: &str = "rewindFlag";
}

/// The persisted, mutable unit of execution stored under `{instanceId}:{idx}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub name: String,
    pub handler_ref: String,
    pub compensating_handler_ref: Option<String>,
    /// JSON-encoded handler argument
    pub param: String,
    pub ttl_ms: Option<u64>,
    pub retry_limit: u32,
    pub idx: u64,
    pub status: TaskStatus,
    /// Stored as JSON text
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Input carried from the previous step, stored as JSON text
    pub pre_result: Option<Value>,
    /// Set on compensation steps
    pub rewind_flag: bool,
}

impl TaskRecord {
    /// Materialize a plan entry at position `idx`
    pub fn from_definition(def: &TaskDefinition, idx: u64) -> Result<Self> {
        let param = match &def.param {
            Value::Null => "{}".to_string(),
            other => serde_json::to_string(other)?,
        };

        Ok(Self {
            name: def.name.clone(),
            handler_ref: def.handler_ref.clone(),
            compensating_handler_ref: def.compensating_handler_ref.clone(),
            param,
            ttl_ms: def.ttl_ms,
            retry_limit: def.retry_limit,
            idx,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            pre_result: None,
            rewind_flag: false,
        })
    }

    /// Copy of this record that runs its compensating handler at `idx`.
    /// Returns `None` when the step declares no compensation.
    pub fn to_compensation(&self, idx: u64) -> Option<Self> {
        let compensator = self.compensating_handler_ref.clone()?;
        Some(Self {
            name: self.name.clone(),
            handler_ref: compensator.clone(),
            compensating_handler_ref: Some(compensator),
            param: self.param.clone(),
            ttl_ms: self.ttl_ms,
            retry_limit: self.retry_limit,
            idx,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            pre_result: None,
            rewind_flag: true,
        })
    }

    /// Handler identifier to dispatch this record to
    pub fn dispatch_ref(&self) -> &str {
        if self.rewind_flag {
            self.compensating_handler_ref
                .as_deref()
                .unwrap_or(&self.handler_ref)
        } else {
            &self.handler_ref
        }
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert(field::NAME.to_string(), self.name.clone());
        fields.insert(field::HANDLER_REF.to_string(), self.handler_ref.clone());
        if let Some(compensator) = &self.compensating_handler_ref {
            fields.insert(
                field::COMPENSATING_HANDLER_REF.to_string(),
                compensator.clone(),
            );
        }
        fields.insert(field::PARAM.to_string(), self.param.clone());
        if let Some(ttl) = self.ttl_ms {
            fields.insert(field::TTL.to_string(), ttl.to_string());
        }
        fields.insert(field::RETRY_LIMIT.to_string(), self.retry_limit.to_string());
        fields.insert(field::IDX.to_string(), self.idx.to_string());
        fields.insert(field::STATUS.to_string(), self.status.to_string());
        if let Some(result) = &self.result {
            fields.insert(field::RESULT.to_string(), result.to_string());
        }
        if let Some(error) = &self.error {
            fields.insert(field::ERROR.to_string(), error.clone());
        }
        if let Some(pre_result) = &self.pre_result {
            fields.insert(field::PRE_RESULT.to_string(), pre_result.to_string());
        }
        fields.insert(field::REWIND_FLAG.to_string(), self.rewind_flag.to_string());
        fields
    }

    /// Decode a hash read from the store. An empty hash is an absent record.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let invalid = |reason: String| JobError::InvalidRecord {
            key: key.to_string(),
            reason,
        };
        let required = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| invalid(format!("missing field {}", name)))
        };

        let idx = required(field::IDX)?
            .parse::<u64>()
            .map_err(|e| invalid(format!("bad idx: {}", e)))?;
        let ttl_ms = fields
            .get(field::TTL)
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| invalid(format!("bad ttl: {}", e)))?;
        let retry_limit = fields
            .get(field::RETRY_LIMIT)
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| invalid(format!("bad retryLimit: {}", e)))?
            .unwrap_or_else(default_retry_limit);
        let status = fields
            .get(field::STATUS)
            .map(|v| v.parse::<TaskStatus>())
            .transpose()
            .map_err(invalid)?
            .unwrap_or(TaskStatus::Pending);
        let json_field = |name: &str| {
            fields
                .get(name)
                .map(|raw| serde_json::from_str::<Value>(raw))
                .transpose()
                .map_err(|e| invalid(format!("bad {}: {}", name, e)))
        };

        Ok(Some(Self {
            name: required(field::NAME)?,
            handler_ref: required(field::HANDLER_REF)?,
            compensating_handler_ref: fields.get(field::COMPENSATING_HANDLER_REF).cloned(),
            param: fields
                .get(field::PARAM)
                .cloned()
                .unwrap_or_else(|| "{}".to_string()),
            ttl_ms,
            retry_limit,
            idx,
            status,
            result: json_field(field::RESULT)?,
            error: fields.get(field::ERROR).cloned(),
            pre_result: json_field(field::PRE_RESULT)?,
            rewind_flag: fields
                .get(field::REWIND_FLAG)
                .map(|v| v == "true")
                .unwrap_or(false),
        }))
    }
}

/// Render a job result for the job key: strings are stored raw, everything
/// else as JSON. Step records keep results as JSON text instead.
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
