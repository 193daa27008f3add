use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::estimate::{HeuristicEstimator, TokenEstimator};
use crate::memory::{MemoryEntry, Priority, WorkingMemory};
use crate::tools::{memory_tools, Tool};

use super::plugin::{ContextPlugin, TokenCache};

// ---------------------------------------------------------------------------
// Working memory
// ---------------------------------------------------------------------------

const MEMORY_INSTRUCTIONS: &str = "\
You have a bounded working memory. Store anything worth keeping across steps \
with memory_store; look entries up with memory_get and memory_query, and free \
space with memory_delete. Key prefixes signal importance: raw. for scratch \
data (evicted first), summary. for condensed notes, findings. for conclusions \
worth keeping. The current index of entries appears below; fetch a value by \
key when you need it.";

/// Exposes the working memory to the context: instructions about the memory
/// tools, the rendered index as dynamic content, and the tools themselves.
/// Compactable by evicting low-priority unpinned entries.
pub struct WorkingMemoryPlugin {
    memory: Arc<WorkingMemory>,
    content_cache: TokenCache,
}

impl WorkingMemoryPlugin {
    pub fn new(memory: Arc<WorkingMemory>) -> Self {
        Self { memory, content_cache: TokenCache::new() }
    }

    pub fn memory(&self) -> &Arc<WorkingMemory> {
        &self.memory
    }
}

impl ContextPlugin for WorkingMemoryPlugin {
    fn name(&self) -> &str {
        "working_memory"
    }

    fn instructions(&self) -> Option<String> {
        Some(MEMORY_INSTRUCTIONS.to_string())
    }

    fn content(&self) -> Option<String> {
        Some(self.memory.render_index())
    }

    fn raw_contents(&self) -> Value {
        serde_json::to_value(self.memory.list()).unwrap_or(Value::Null)
    }

    fn token_size(&self, estimator: &dyn TokenEstimator) -> u32 {
        let index = self.memory.render_index();
        self.content_cache
            .get_or(self.memory.generation(), || estimator.estimate_text(&index))
    }

    fn is_compactable(&self) -> bool {
        true
    }

    /// Evict unpinned entries, lowest priority first, until the index has
    /// shrunk by the target (or nothing evictable remains).
    fn compact(&self, target_tokens: u32) -> u32 {
        let estimator = HeuristicEstimator;
        let before = estimator.estimate_text(&self.memory.render_index());
        let mut freed = 0;

        let mut victims: Vec<MemoryEntry> =
            self.memory.list().into_iter().filter(|e| !e.pinned).collect();
        victims.sort_by_key(|e| (e.effective_priority(), e.last_accessed_at));

        for victim in victims {
            if freed >= target_tokens {
                break;
            }
            self.memory.delete(&victim.key);
            let now = estimator.estimate_text(&self.memory.render_index());
            freed = before.saturating_sub(now);
        }
        freed
    }

    fn compaction_priority(&self) -> u8 {
        // Memory is rebuildable by the model; compact it before anything else.
        80
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        memory_tools()
    }

    fn state(&self) -> Value {
        serde_json::to_value(self.memory.list()).unwrap_or(Value::Null)
    }

    fn restore_state(&self, state: &Value) -> Result<(), AgentError> {
        let entries: Vec<MemoryEntry> = serde_json::from_value(state.clone())
            .map_err(|e| AgentError::Context(format!("bad working_memory state: {e}")))?;
        self.memory.restore_entries(entries);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-context memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InContextEntry {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
}

/// Small KV rendered verbatim into the system message. Unlike working
/// memory, values appear inline, so keep entries small. Never compacted by
/// default.
#[derive(Default)]
pub struct InContextMemoryPlugin {
    entries: Mutex<BTreeMap<String, InContextEntry>>,
    generation: AtomicU64,
    cache: TokenCache,
}

impl InContextMemoryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Value, priority: Option<Priority>) {
        self.entries
            .lock()
            .expect("in-context lock poisoned")
            .insert(key.to_string(), InContextEntry { value, priority });
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .expect("in-context lock poisoned")
            .get(key)
            .map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .expect("in-context lock poisoned")
            .remove(key)
            .is_some();
        if removed {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().expect("in-context lock poisoned").clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("in-context lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full snapshot, for validation prompts.
    pub fn snapshot(&self) -> Value {
        let entries = self.entries.lock().expect("in-context lock poisoned");
        Value::Object(entries.iter().map(|(k, e)| (k.clone(), e.value.clone())).collect())
    }
}

impl ContextPlugin for InContextMemoryPlugin {
    fn name(&self) -> &str {
        "in_context_memory"
    }

    fn content(&self) -> Option<String> {
        let entries = self.entries.lock().expect("in-context lock poisoned");
        if entries.is_empty() {
            return None;
        }
        let mut sorted: Vec<(&String, &InContextEntry)> = entries.iter().collect();
        sorted.sort_by_key(|(k, e)| (std::cmp::Reverse(e.priority), k.to_string()));
        let mut out = String::from("Pinned context:\n");
        for (key, entry) in sorted {
            out.push_str(&format!("- {key}: {}\n", entry.value));
        }
        Some(out)
    }

    fn raw_contents(&self) -> Value {
        self.snapshot()
    }

    fn token_size(&self, estimator: &dyn TokenEstimator) -> u32 {
        let content = self.content();
        self.cache.get_or(self.generation.load(Ordering::SeqCst), || {
            content.map(|c| estimator.estimate_text(&c)).unwrap_or(0)
        })
    }

    fn state(&self) -> Value {
        let entries = self.entries.lock().expect("in-context lock poisoned");
        serde_json::to_value(&*entries).unwrap_or(Value::Null)
    }

    fn restore_state(&self, state: &Value) -> Result<(), AgentError> {
        let restored: BTreeMap<String, InContextEntry> = serde_json::from_value(state.clone())
            .map_err(|e| AgentError::Context(format!("bad in_context_memory state: {e}")))?;
        *self.entries.lock().expect("in-context lock poisoned") = restored;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistent instructions
// ---------------------------------------------------------------------------

/// User-scoped standing instructions, prepended to every session. Never
/// compacted.
#[derive(Default)]
pub struct PersistentInstructionsPlugin {
    instructions: Mutex<Vec<String>>,
    generation: AtomicU64,
    cache: TokenCache,
}

impl PersistentInstructionsPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, instruction: impl Into<String>) {
        self.instructions
            .lock()
            .expect("instructions lock poisoned")
            .push(instruction.into());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.instructions.lock().expect("instructions lock poisoned").clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl ContextPlugin for PersistentInstructionsPlugin {
    fn name(&self) -> &str {
        "persistent_instructions"
    }

    fn instructions(&self) -> Option<String> {
        let list = self.instructions.lock().expect("instructions lock poisoned");
        if list.is_empty() {
            None
        } else {
            Some(format!("Standing instructions:\n{}", list.join("\n")))
        }
    }

    fn raw_contents(&self) -> Value {
        let list = self.instructions.lock().expect("instructions lock poisoned");
        serde_json::to_value(&*list).unwrap_or(Value::Null)
    }

    fn instructions_token_size(&self, estimator: &dyn TokenEstimator) -> u32 {
        let text = self.instructions();
        self.cache.get_or(self.generation.load(Ordering::SeqCst), || {
            text.map(|t| estimator.estimate_text(&t)).unwrap_or(0)
        })
    }

    fn state(&self) -> Value {
        self.raw_contents()
    }

    fn restore_state(&self, state: &Value) -> Result<(), AgentError> {
        let restored: Vec<String> = serde_json::from_value(state.clone())
            .map_err(|e| AgentError::Context(format!("bad persistent_instructions state: {e}")))?;
        *self.instructions.lock().expect("instructions lock poisoned") = restored;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// User info
// ---------------------------------------------------------------------------

/// Facts about the user, rendered as a short block. Never compacted.
#[derive(Default)]
pub struct UserInfoPlugin {
    fields: Mutex<BTreeMap<String, String>>,
}

impl UserInfoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, field: &str, value: impl Into<String>) {
        self.fields
            .lock()
            .expect("user info lock poisoned")
            .insert(field.to_string(), value.into());
    }
}

impl ContextPlugin for UserInfoPlugin {
    fn name(&self) -> &str {
        "user_info"
    }

    fn content(&self) -> Option<String> {
        let fields = self.fields.lock().expect("user info lock poisoned");
        if fields.is_empty() {
            return None;
        }
        let mut out = String::from("About the user:\n");
        for (field, value) in fields.iter() {
            out.push_str(&format!("- {field}: {value}\n"));
        }
        Some(out)
    }

    fn raw_contents(&self) -> Value {
        let fields = self.fields.lock().expect("user info lock poisoned");
        serde_json::to_value(&*fields).unwrap_or(Value::Null)
    }

    fn state(&self) -> Value {
        self.raw_contents()
    }

    fn restore_state(&self, state: &Value) -> Result<(), AgentError> {
        let restored: BTreeMap<String, String> = serde_json::from_value(state.clone())
            .map_err(|e| AgentError::Context(format!("bad user_info state: {e}")))?;
        *self.fields.lock().expect("user info lock poisoned") = restored;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Todo list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub done: bool,
}

/// A simple checklist surfaced to the model each turn. Never compacted.
#[derive(Default)]
pub struct TodoPlugin {
    items: Mutex<Vec<TodoItem>>,
}

impl TodoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, text: impl Into<String>) {
        self.items
            .lock()
            .expect("todo lock poisoned")
            .push(TodoItem { text: text.into(), done: false });
    }

    pub fn complete(&self, index: usize) -> bool {
        let mut items = self.items.lock().expect("todo lock poisoned");
        match items.get_mut(index) {
            Some(item) => {
                item.done = true;
                true
            }
            None => false,
        }
    }

    pub fn items(&self) -> Vec<TodoItem> {
        self.items.lock().expect("todo lock poisoned").clone()
    }
}

impl ContextPlugin for TodoPlugin {
    fn name(&self) -> &str {
        "todo"
    }

    fn content(&self) -> Option<String> {
        let items = self.items.lock().expect("todo lock poisoned");
        if items.is_empty() {
            return None;
        }
        let mut out = String::from("Todo:\n");
        for item in items.iter() {
            let mark = if item.done { "x" } else { " " };
            out.push_str(&format!("- [{mark}] {}\n", item.text));
        }
        Some(out)
    }

    fn raw_contents(&self) -> Value {
        serde_json::to_value(self.items()).unwrap_or(Value::Null)
    }

    fn state(&self) -> Value {
        self.raw_contents()
    }

    fn restore_state(&self, state: &Value) -> Result<(), AgentError> {
        let restored: Vec<TodoItem> = serde_json::from_value(state.clone())
            .map_err(|e| AgentError::Context(format!("bad todo state: {e}")))?;
        *self.items.lock().expect("todo lock poisoned") = restored;
        Ok(())
    }
}
