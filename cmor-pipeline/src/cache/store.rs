// Durable Cache Store
// Optional backend that keeps step outputs beyond the current process

use super::StepOutput;
use crate::pipeline::CacheKey;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur in a durable cache backend
#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent key-value storage for step outputs
pub trait DurableStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<StepOutput>, CacheStoreError>;

    fn store(&self, key: &CacheKey, output: &StepOutput) -> Result<(), CacheStoreError>;
}

/// Stores one JSON document per cache key in a directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl Default for DirectoryStore {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cmor-pipeline")
            .join("steps");
        Self { root }
    }
}

impl DirectoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.json", key.as_str()))
    }
}

impl DurableStore for DirectoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<StepOutput>, CacheStoreError> {
        let path = self.entry_path(key);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }

    fn store(&self, key: &CacheKey, output: &StepOutput) -> Result<(), CacheStoreError> {
        fs::create_dir_all(&self.root)?;
        let path = self.entry_path(key);
        // readers never observe a partially written entry
        let partial = path.with_extension("json.partial");
        fs::write(&partial, serde_json::to_vec(output)?)?;
        fs::rename(&partial, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;

    #[test]
    fn test_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("cache"));
        let key = CacheKey::from_digest("abc123");

        assert!(store.load(&key).unwrap().is_none());

        let mut output = StepOutput::new(Dataset::new("tas").with_values(vec![1.5]));
        output
            .annotations
            .insert("output_path".to_string(), "/tmp/x".to_string());
        store.store(&key, &output).unwrap();

        let loaded = store.load(&key).unwrap().unwrap();
        assert_eq!(loaded, output);
        assert!(dir.path().join("cache/abc123.json").exists());
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        assert!(matches!(
            store.load(&CacheKey::from_digest("bad")),
            Err(CacheStoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_default_root_under_cache_dir() {
        let store = DirectoryStore::default();
        assert!(store.root().ends_with("cmor-pipeline/steps"));
    }
}
