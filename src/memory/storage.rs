use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::MemoryError;

/// Dumb byte store for memory persistence. The memory itself stays
/// authoritative for scope lifecycle; this just holds blobs.
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    async fn save(&self, key: &str, state: &Value) -> Result<(), MemoryError>;
    async fn load(&self, key: &str) -> Result<Option<Value>, MemoryError>;
    async fn delete(&self, key: &str) -> Result<(), MemoryError>;
    async fn exists(&self, key: &str) -> Result<bool, MemoryError>;
}

/// Compose the storage key from the owning user and memory id.
pub fn storage_key(user_id: Option<&str>, memory_id: &str) -> String {
    match user_id {
        Some(user) => format!("{user}/{memory_id}"),
        None => memory_id.to_string(),
    }
}

/// No persistence. Loads always miss.
pub struct NoMemoryStorage;

#[async_trait]
impl MemoryStorage for NoMemoryStorage {
    async fn save(&self, _: &str, _: &Value) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<Value>, MemoryError> {
        Ok(None)
    }

    async fn delete(&self, _: &str) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn exists(&self, _: &str) -> Result<bool, MemoryError> {
        Ok(false)
    }
}

/// JSON files on disk, one per key. Slashes in keys become directories.
pub struct FileMemoryStorage {
    dir: PathBuf,
}

impl FileMemoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl MemoryStorage for FileMemoryStorage {
    async fn save(&self, key: &str, state: &Value) -> Result<(), MemoryError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| MemoryError::Storage(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::Storage(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), MemoryError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoryError::Storage(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, MemoryError> {
        Ok(tokio::fs::try_exists(self.path(key)).await.unwrap_or(false))
    }
}
