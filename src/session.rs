use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::types::ConversationMessage;

/// Versioned session document: everything needed to rebuild an agent that
/// behaves identically for subsequent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub version: u32,
    pub conversation: Vec<ConversationMessage>,
    /// Plugin name → that plugin's state blob.
    pub plugin_states: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Unix milliseconds.
    pub saved_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub model: String,
}

/// Persists session documents so an agent can stop and resume in place.
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn save(&self, key: &str, document: &SessionDocument) -> Result<(), AgentError>;
    async fn load(&self, key: &str) -> Result<Option<SessionDocument>, AgentError>;
    async fn delete(&self, key: &str) -> Result<(), AgentError>;
    async fn exists(&self, key: &str) -> Result<bool, AgentError>;
}

/// No persistence. Fire-and-forget.
pub struct NoSessionManager;

#[async_trait]
impl SessionManager for NoSessionManager {
    async fn save(&self, _: &str, _: &SessionDocument) -> Result<(), AgentError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<SessionDocument>, AgentError> {
        Ok(None)
    }

    async fn delete(&self, _: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn exists(&self, _: &str) -> Result<bool, AgentError> {
        Ok(false)
    }
}

/// Saves session documents to disk as JSON, one file per key.
pub struct FileSessionManager {
    dir: PathBuf,
}

impl FileSessionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl SessionManager for FileSessionManager {
    async fn save(&self, key: &str, document: &SessionDocument) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Session(e.to_string()))?;
        let json = serde_json::to_string_pretty(document)
            .map_err(|e| AgentError::Session(e.to_string()))?;
        tokio::fs::write(self.path(key), json)
            .await
            .map_err(|e| AgentError::Session(e.to_string()))
    }

    async fn load(&self, key: &str) -> Result<Option<SessionDocument>, AgentError> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(json) => {
                let document: SessionDocument =
                    serde_json::from_str(&json).map_err(|e| AgentError::Session(e.to_string()))?;
                Ok(Some(document))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Session(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), AgentError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Session(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, AgentError> {
        Ok(tokio::fs::try_exists(self.path(key)).await.unwrap_or(false))
    }
}
