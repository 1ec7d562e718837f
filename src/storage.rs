//! Key/value storage
//! The link only remembers one thing between runs: the identifier of the
//! last badge it connected to. Callers must treat every failure here as
//! non-fatal.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use tokio::fs;
use tokio::sync::Mutex;

use crate::core::bluetooth::error::LinkError;
use crate::utils::ensure_directory_exists;

/// Small string store standing in for the platform's secure storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, LinkError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), LinkError>;
    async fn delete(&self, key: &str) -> Result<(), LinkError>;
}

/// Process-local store, forgotten on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LinkError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LinkError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LinkError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, LinkError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&self.path)
            .await
            .map_err(|e| LinkError::Storage(format!("reading {}: {}", self.path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| LinkError::Storage(format!("parsing {}: {}", self.path.display(), e)))
    }

    async fn write_all(&self, values: &HashMap<String, String>) -> Result<(), LinkError> {
        if let Some(dir) = self.path.parent() {
            ensure_directory_exists(dir)
                .await
                .map_err(|e| LinkError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(values)
            .map_err(|e| LinkError::Storage(e.to_string()))?;
        fs::write(&self.path, json)
            .await
            .map_err(|e| LinkError::Storage(format!("writing {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LinkError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LinkError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        debug!("Storing {} in {:?}", key, self.path);
        self.write_all(&values).await
    }

    async fn delete(&self, key: &str) -> Result<(), LinkError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = std::env::temp_dir().join(format!("badge-link-store-{}", std::process::id()));
        let path = dir.join("store.json");

        let store = JsonFileStore::new(&path);
        assert_eq!(store.get("last").await.unwrap(), None);
        store.set("last", "AA:BB").await.unwrap();
        store.set("other", "x").await.unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.get("last").await.unwrap().as_deref(), Some("AA:BB"));
        reopened.delete("last").await.unwrap();
        assert_eq!(reopened.get("last").await.unwrap(), None);
        assert_eq!(reopened.get("other").await.unwrap().as_deref(), Some("x"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_file() {
        let dir = std::env::temp_dir().join(format!("badge-link-corrupt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.get("last").await, Err(LinkError::Storage(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
