pub mod memory;
pub mod redb_store;

pub use memory::MemoryRecordStore;
pub use redb_store::RedbRecordStore;

use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

/// A single staged write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set { key: String, value: String },
    Delete { key: String },
    HashSet { key: String, field: String, value: String },
    HashSetMulti { key: String, fields: HashMap<String, String> },
}

/// Writes staged for one atomic commit via [`RecordStore::commit`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn hash_set(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(BatchOp::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hash_set_multi(
        &mut self,
        key: impl Into<String>,
        fields: HashMap<String, String>,
    ) -> &mut Self {
        self.ops.push(BatchOp::HashSetMulti {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-value and hash storage shared by every job instance.
///
/// A key holds either a scalar or a hash; `delete` removes either kind.
/// Absent hashes read back as an empty map.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set a scalar that disappears after `ttl`
    async fn set_with_expiry(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;

    /// Remaining lifetime of a scalar; `None` if it is absent or permanent
    async fn expires_in(&self, key: &str) -> Result<Option<Duration>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Merge `fields` into the hash at `key`
    async fn hash_set_multi(&self, key: &str, fields: &HashMap<String, String>) -> Result<()>;

    /// Apply every staged op atomically, in order
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}
