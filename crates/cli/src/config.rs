use anyhow::{Context, Result};
use jobchain_core::storage::RedbRecordStore;
use jobchain_core::EngineConfig;
use std::path::{Path, PathBuf};

/// Engine configuration bound to a data directory
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let engine = EngineConfig::load(config_path)?;
        Ok(Self { data_dir, engine })
    }

    /// Get the record store path
    pub fn index_path(&self) -> PathBuf {
        self.engine.index_path(&self.data_dir)
    }

    pub fn open_store(&self) -> Result<RedbRecordStore> {
        RedbRecordStore::new(self.index_path()).context("Failed to open record store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");

        let config = CliConfig::load(&dir.path().join("missing.toml"), data_dir.clone()).unwrap();
        assert!(data_dir.is_dir());
        assert_eq!(config.index_path(), data_dir.join("jobchain.redb"));
    }

    #[test]
    fn test_load_reads_index_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("jobchain.toml");
        std::fs::write(&config_path, "[storage]\nindex_file = \"jobs.redb\"\n").unwrap();

        let config = CliConfig::load(&config_path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.index_path(), dir.path().join("jobs.redb"));
        config.open_store().unwrap();
        assert!(dir.path().join("jobs.redb").exists());
    }
}
