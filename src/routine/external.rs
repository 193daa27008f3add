use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// What kind of external event a task is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalKind {
    /// Resumes when `trigger_external(webhook_id, data)` is called.
    Webhook { webhook_id: String },
    /// Invokes the named tool on an interval until it reports
    /// `{"done": true}`.
    Poll {
        tool: String,
        #[serde(default = "default_poll_interval_ms")]
        interval_ms: u64,
    },
    /// Resumes at a wall-clock time.
    Scheduled { at: DateTime<Utc> },
    /// Resumes when `complete_task_manually(task_id, data)` is called.
    Manual,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDependency {
    #[serde(flatten)]
    pub kind: ExternalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExternalDependency {
    pub fn webhook(webhook_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            kind: ExternalKind::Webhook { webhook_id: webhook_id.into() },
            timeout_ms: Some(timeout_ms),
        }
    }

    pub fn manual() -> Self {
        Self { kind: ExternalKind::Manual, timeout_ms: None }
    }
}

/// Rendezvous point between waiting tasks and external callers. The
/// executor registers a waiter when a task enters `waiting_external`;
/// `trigger` / `complete` deliver the payload from any other context.
#[derive(Default)]
pub struct ExternalWaits {
    webhooks: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    manual: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl ExternalWaits {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_webhook(&self, webhook_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.webhooks
            .lock()
            .expect("external waits lock poisoned")
            .insert(webhook_id.to_string(), tx);
        rx
    }

    /// Deliver webhook data. Returns false when nothing is waiting on the
    /// id (unknown or already fired).
    pub fn trigger(&self, webhook_id: &str, data: Value) -> bool {
        let sender = self
            .webhooks
            .lock()
            .expect("external waits lock poisoned")
            .remove(webhook_id);
        match sender {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    pub(crate) fn register_manual(&self, task_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.manual
            .lock()
            .expect("external waits lock poisoned")
            .insert(task_id.to_string(), tx);
        rx
    }

    /// Complete a manually-gated task. Returns false when the task is not
    /// waiting.
    pub fn complete(&self, task_id: &str, data: Value) -> bool {
        let sender = self
            .manual
            .lock()
            .expect("external waits lock poisoned")
            .remove(task_id);
        match sender {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Whether anything is waiting on the given webhook id.
    pub fn is_waiting(&self, webhook_id: &str) -> bool {
        self.webhooks
            .lock()
            .expect("external waits lock poisoned")
            .contains_key(webhook_id)
    }
}
