use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, usually read from `jobchain.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub jobs: JobDefaults,

    /// Keep completed queue jobs around for inspection
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "jobchain.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

/// Defaults applied to every submission that does not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_uniq_field")]
    pub uniq_field: String,

    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// Negative means the result never expires
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: i64,
}

fn default_uniq_field() -> String {
    "id".to_string()
}

fn default_job_ttl_secs() -> u64 {
    60 * 5
}

fn default_result_ttl_secs() -> i64 {
    3600 * 24 * 3
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            uniq_field: default_uniq_field(),
            job_ttl_secs: default_job_ttl_secs(),
            result_ttl_secs: default_result_ttl_secs(),
        }
    }
}

/// Per-submission options
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOptions {
    /// Field of the job data that identifies the instance
    pub uniq_field: String,
    /// Deadline for the whole head job
    pub job_ttl: Duration,
    /// Lifetime of the persisted result in seconds; negative keeps it forever
    pub result_ttl_secs: i64,
}

impl SubmitOptions {
    pub fn uniq_field(mut self, field: impl Into<String>) -> Self {
        self.uniq_field = field.into();
        self
    }

    pub fn job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = ttl;
        self
    }

    pub fn result_ttl_secs(mut self, secs: i64) -> Self {
        self.result_ttl_secs = secs;
        self
    }

    /// Expiry to apply to the job result, `None` for a permanent result
    pub fn result_expiry(&self) -> Option<Duration> {
        u64::try_from(self.result_ttl_secs)
            .ok()
            .map(Duration::from_secs)
    }
}

impl From<&JobDefaults> for SubmitOptions {
    fn from(defaults: &JobDefaults) -> Self {
        Self {
            uniq_field: defaults.uniq_field.clone(),
            job_ttl: Duration::from_secs(defaults.job_ttl_secs),
            result_ttl_secs: defaults.result_ttl_secs,
        }
    }
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self::from(&JobDefaults::default())
    }
}

impl EngineConfig {
    /// Load the config file if it exists, otherwise use defaults
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Get the record store path under `data_dir`
    pub fn index_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.storage.index_file)
    }

    /// Completed queue jobs are dropped unless running in debug mode
    pub fn remove_on_complete(&self) -> bool {
        !self.debug
    }

    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions::from(&self.jobs)
    }
}
