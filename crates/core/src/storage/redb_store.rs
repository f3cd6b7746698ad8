use super::{BatchOp, RecordStore, WriteBatch};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SCALARS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("scalars");
const HASHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hashes");

type RawTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

#[derive(Debug, Serialize, Deserialize)]
struct StoredScalar {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredScalar {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Durable record store backed by redb.
///
/// Expiry is stored as an absolute UTC timestamp and checked on read.
#[derive(Clone)]
pub struct RedbRecordStore {
    db: Arc<Database>,
}

impl RedbRecordStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _scalars = write_txn
                .open_table(SCALARS_TABLE)
                .context("Failed to open scalars table")?;
            let _hashes = write_txn
                .open_table(HASHES_TABLE)
                .context("Failed to open hashes table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run `ops` inside one write transaction
    fn write<F>(&self, ops: F) -> Result<()>
    where
        F: FnOnce(&mut RawTable<'_>, &mut RawTable<'_>) -> Result<()>,
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut scalars = write_txn
                .open_table(SCALARS_TABLE)
                .context("Failed to open scalars table")?;
            let mut hashes = write_txn
                .open_table(HASHES_TABLE)
                .context("Failed to open hashes table")?;
            ops(&mut scalars, &mut hashes)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn read_scalar(&self, key: &str) -> Result<Option<StoredScalar>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(SCALARS_TABLE)
            .context("Failed to open table")?;

        let value = table.get(key).context("Failed to get scalar")?;

        match value {
            Some(guard) => {
                let scalar: StoredScalar = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize scalar")?;
                Ok(Some(scalar).filter(|s| s.is_live(Utc::now())))
            }
            None => Ok(None),
        }
    }

    fn put_scalar(
        scalars: &mut RawTable<'_>,
        hashes: &mut RawTable<'_>,
        key: &str,
        scalar: &StoredScalar,
    ) -> Result<()> {
        let value = serde_json::to_vec(scalar).context("Failed to serialize scalar")?;
        hashes.remove(key).context("Failed to replace hash")?;
        scalars
            .insert(key, value.as_slice())
            .context("Failed to insert scalar")?;
        Ok(())
    }

    fn merge_hash(
        scalars: &mut RawTable<'_>,
        hashes: &mut RawTable<'_>,
        key: &str,
        fields: HashMap<String, String>,
    ) -> Result<()> {
        let existing = hashes
            .get(key)
            .context("Failed to get hash")?
            .map(|guard| guard.value().to_vec());

        let mut merged: HashMap<String, String> = match existing {
            Some(bytes) => serde_json::from_slice(&bytes).context("Failed to deserialize hash")?,
            None => HashMap::new(),
        };
        merged.extend(fields);

        let value = serde_json::to_vec(&merged).context("Failed to serialize hash")?;
        scalars.remove(key).context("Failed to replace scalar")?;
        hashes
            .insert(key, value.as_slice())
            .context("Failed to insert hash")?;
        Ok(())
    }

    fn apply(scalars: &mut RawTable<'_>, hashes: &mut RawTable<'_>, op: BatchOp) -> Result<()> {
        match op {
            BatchOp::Set { key, value } => Self::put_scalar(
                scalars,
                hashes,
                &key,
                &StoredScalar {
                    value,
                    expires_at: None,
                },
            ),
            BatchOp::Delete { key } => {
                scalars.remove(key.as_str()).context("Failed to delete scalar")?;
                hashes.remove(key.as_str()).context("Failed to delete hash")?;
                Ok(())
            }
            BatchOp::HashSet { key, field, value } => {
                Self::merge_hash(scalars, hashes, &key, HashMap::from([(field, value)]))
            }
            BatchOp::HashSetMulti { key, fields } => Self::merge_hash(scalars, hashes, &key, fields),
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for RedbRecordStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_scalar(key)?.map(|s| s.value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let scalar = StoredScalar {
            value: value.to_string(),
            expires_at: None,
        };
        self.write(|scalars, hashes| Self::put_scalar(scalars, hashes, key, &scalar))
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).context("Expiry out of range")?;
        let scalar = StoredScalar {
            value: value.to_string(),
            expires_at: Some(Utc::now() + ttl),
        };
        self.write(|scalars, hashes| Self::put_scalar(scalars, hashes, key, &scalar))
    }

    async fn expires_in(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .read_scalar(key)?
            .and_then(|s| s.expires_at)
            .and_then(|at| (at - Utc::now()).to_std().ok()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write(|scalars, hashes| {
            Self::apply(
                scalars,
                hashes,
                BatchOp::Delete {
                    key: key.to_string(),
                },
            )
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(HASHES_TABLE)
            .context("Failed to open table")?;

        let value = table.get(key).context("Failed to get hash")?;

        match value {
            Some(guard) => {
                let fields: HashMap<String, String> = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize hash")?;
                Ok(fields)
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_set_multi(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        let fields = fields.clone();
        self.write(|scalars, hashes| Self::merge_hash(scalars, hashes, key, fields))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        // Dropping the transaction on error aborts every staged op.
        self.write(|scalars, hashes| {
            for op in batch.into_ops() {
                Self::apply(scalars, hashes, op)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, RedbRecordStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbRecordStore::new(temp_file.path().to_path_buf()).unwrap();
        (temp_file, store)
    }

    #[tokio::test]
    async fn test_redb_record_store() {
        let (_file, store) = open_store();

        store.set("signup:id:7", "init").await.unwrap();
        assert_eq!(
            store.get("signup:id:7").await.unwrap().as_deref(),
            Some("init")
        );

        let mut fields = HashMap::new();
        fields.insert("name".to_string(), "ipsum".to_string());
        fields.insert("status".to_string(), "pending".to_string());
        store.hash_set_multi("signup:7:0", &fields).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .hash_set("signup:7:0", "status", "complete")
            .hash_set("signup:7:0", "result", "bar");
        store.commit(batch).await.unwrap();

        let hash = store.hash_get_all("signup:7:0").await.unwrap();
        assert_eq!(hash["name"], "ipsum");
        assert_eq!(hash["status"], "complete");
        assert_eq!(hash["result"], "bar");

        store.delete("signup:7:0").await.unwrap();
        assert!(store.hash_get_all("signup:7:0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redb_survives_reopen() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let store = RedbRecordStore::new(temp_file.path().to_path_buf()).unwrap();
            store.set("k", "v").await.unwrap();
        }

        let store = RedbRecordStore::new(temp_file.path().to_path_buf()).unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_redb_expiry() {
        let (_file, store) = open_store();

        store
            .set_with_expiry("short", Duration::from_millis(50), "x")
            .await
            .unwrap();
        store
            .set_with_expiry("long", Duration::from_secs(3600), "y")
            .await
            .unwrap();
        store.set("forever", "z").await.unwrap();

        let remaining = store.expires_in("long").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(3600));
        assert!(remaining > Duration::from_secs(3590));
        assert_eq!(store.expires_in("forever").await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("y"));
        assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("z"));
    }
}
