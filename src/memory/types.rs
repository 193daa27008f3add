use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MemoryError;

/// Eviction priority. Lower priorities go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Lifecycle class of an entry. Task-scoped entries name the tasks they
/// belong to and are dropped once every named task is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    Session,
    Plan,
    Task { task_ids: Vec<String> },
    Persistent,
}

impl Default for Scope {
    fn default() -> Self {
        Self::Session
    }
}

/// Key-prefix convention mapping onto a default priority. Hints only — an
/// explicit priority on the entry always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Summary,
    Findings,
}

impl Tier {
    pub fn from_key(key: &str) -> Option<Self> {
        if key.starts_with("raw.") {
            Some(Self::Raw)
        } else if key.starts_with("summary.") {
            Some(Self::Summary)
        } else if key.starts_with("findings.") {
            Some(Self::Findings)
        } else {
            None
        }
    }

    pub fn default_priority(self) -> Priority {
        match self {
            Self::Raw => Priority::Low,
            Self::Summary => Priority::Normal,
            Self::Findings => Priority::High,
        }
    }
}

static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]([A-Za-z0-9_-]|\.[A-Za-z0-9_-])*$").expect("key regex")
});

/// Dotted-namespace key: no leading, trailing, or consecutive dots.
pub fn validate_key(key: &str) -> Result<(), MemoryError> {
    if key.is_empty() {
        return Err(MemoryError::KeyFormat { key: key.into(), reason: "empty key" });
    }
    if !KEY_RE.is_match(key) {
        return Err(MemoryError::KeyFormat {
            key: key.into(),
            reason: "must be alphanumeric segments separated by single dots",
        });
    }
    Ok(())
}

/// One stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub description: String,
    pub value: Value,
    pub size_bytes: usize,
    #[serde(default)]
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub pinned: bool,
}

impl MemoryEntry {
    /// Explicit priority, else the tier hint, else normal.
    pub fn effective_priority(&self) -> Priority {
        self.priority
            .or_else(|| Tier::from_key(&self.key).map(Tier::default_priority))
            .unwrap_or(Priority::Normal)
    }

    pub fn tier(&self) -> Option<Tier> {
        Tier::from_key(&self.key)
    }
}

/// Options for `WorkingMemory::set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub scope: Option<Scope>,
    pub priority: Option<Priority>,
    pub pinned: bool,
}

impl SetOptions {
    pub fn scope(scope: Scope) -> Self {
        Self { scope: Some(scope), ..Default::default() }
    }

    pub fn priority(priority: Priority) -> Self {
        Self { priority: Some(priority), ..Default::default() }
    }

    pub fn pinned() -> Self {
        Self { pinned: true, ..Default::default() }
    }
}
