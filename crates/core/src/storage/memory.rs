use super::{BatchOp, RecordStore, WriteBatch};
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Scalar {
    value: String,
    expires_at: Option<Instant>,
}

impl Scalar {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    scalars: HashMap<String, Scalar>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Keyspace {
    fn set(&mut self, key: String, value: String, expires_at: Option<Instant>) {
        self.hashes.remove(&key);
        self.scalars.insert(key, Scalar { value, expires_at });
    }

    fn delete(&mut self, key: &str) {
        self.scalars.remove(key);
        self.hashes.remove(key);
    }

    // A hash write over a scalar replaces it.
    fn hash_mut(&mut self, key: String) -> &mut HashMap<String, String> {
        self.scalars.remove(&key);
        self.hashes.entry(key).or_default()
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Set { key, value } => self.set(key, value, None),
            BatchOp::Delete { key } => self.delete(&key),
            BatchOp::HashSet { key, field, value } => {
                self.hash_mut(key).insert(field, value);
            }
            BatchOp::HashSetMulti { key, fields } => {
                self.hash_mut(key).extend(fields);
            }
        }
    }
}

/// In-process record store. Expiry follows the tokio clock, so paused-time
/// tests can advance it.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    keyspace: RwLock<Keyspace>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let keyspace = self.keyspace.read().await;
        keyspace.scalars.values().filter(|s| s.is_live(now)).count() + keyspace.hashes.len()
    }

    /// Live keys starting with `prefix`, sorted
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let keyspace = self.keyspace.read().await;
        let mut keys: Vec<String> = keyspace
            .scalars
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && s.is_live(now))
            .map(|(k, _)| k.clone())
            .chain(
                keyspace
                    .hashes
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned(),
            )
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let keyspace = self.keyspace.read().await;
        Ok(keyspace
            .scalars
            .get(key)
            .filter(|s| s.is_live(now))
            .map(|s| s.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.keyspace
            .write()
            .await
            .set(key.to_string(), value.to_string(), None);
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        self.keyspace.write().await.set(
            key.to_string(),
            value.to_string(),
            Some(Instant::now() + ttl),
        );
        Ok(())
    }

    async fn expires_in(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let keyspace = self.keyspace.read().await;
        Ok(keyspace
            .scalars
            .get(key)
            .and_then(|s| s.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.keyspace.write().await.delete(key);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let keyspace = self.keyspace.read().await;
        Ok(keyspace.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set_multi(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        self.keyspace
            .write()
            .await
            .hash_mut(key.to_string())
            .extend(fields.clone());
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut keyspace = self.keyspace.write().await;
        for op in batch.into_ops() {
            keyspace.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scalar_and_hash() {
        let store = MemoryRecordStore::new();

        store.set("job:id:1", "init").await.unwrap();
        assert_eq!(store.get("job:id:1").await.unwrap().as_deref(), Some("init"));

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "pending".to_string());
        store.hash_set_multi("job:1:0", &fields).await.unwrap();

        let mut more = HashMap::new();
        more.insert("result".to_string(), "bar".to_string());
        store.hash_set_multi("job:1:0", &more).await.unwrap();

        let hash = store.hash_get_all("job:1:0").await.unwrap();
        assert_eq!(hash.len(), 2);
        assert_eq!(hash["status"], "pending");
        assert!(store.hash_get_all("job:1:1").await.unwrap().is_empty());

        store.delete("job:1:0").await.unwrap();
        assert!(store.hash_get_all("job:1:0").await.unwrap().is_empty());
        assert_eq!(store.keys_with_prefix("job:").await, vec!["job:id:1".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_applies_in_order() {
        let store = MemoryRecordStore::new();
        store.set("stale", "x").await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .hash_set("a:0", "status", "complete")
            .hash_set("a:0", "result", "bar")
            .delete("stale")
            .set("k", "v");
        assert_eq!(batch.len(), 4);
        store.commit(batch).await.unwrap();

        let hash = store.hash_get_all("a:0").await.unwrap();
        assert_eq!(hash["status"], "complete");
        assert_eq!(hash["result"], "bar");
        assert_eq!(store.get("stale").await.unwrap(), None);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_clock() {
        let store = MemoryRecordStore::new();
        store
            .set_with_expiry("result", Duration::from_secs(3), "barqux")
            .await
            .unwrap();
        store.set("forever", "barqux").await.unwrap();

        assert_eq!(
            store.expires_in("result").await.unwrap(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(store.expires_in("forever").await.unwrap(), None);

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert!(store.get("result").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get("result").await.unwrap().is_none());
        assert!(store.get("forever").await.unwrap().is_some());
        assert_eq!(store.len().await, 1);
    }
}
