use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::MemoryError;

use super::storage::MemoryStorage;
use super::types::{validate_key, MemoryEntry, Priority, Scope, SetOptions, Tier};

/// Limits for a working-memory instance.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub max_size_bytes: usize,
    pub description_max_length: usize,
    /// Utilization percentage above which the index render flags pressure.
    pub soft_limit_percent: u8,
    /// Share of the context window the rendered index may occupy.
    pub context_allocation_percent: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 256 * 1024,
            description_max_length: 150,
            soft_limit_percent: 80,
            context_allocation_percent: 20,
        }
    }
}

/// Filter for `query`. All present fields must match.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Substring match against the key.
    pub pattern: Option<String>,
    pub tier: Option<Tier>,
    pub scope: Option<Scope>,
}

struct Inner {
    entries: HashMap<String, MemoryEntry>,
    /// Task ids known to have reached a terminal status.
    terminal_tasks: HashSet<String>,
    total_bytes: usize,
    /// Bumped on every mutation that can change the rendered index, so
    /// callers can cache derived views.
    generation: u64,
}

/// Bounded key/value store with priority-driven eviction and scope-based
/// lifecycle. Writes are serialized by the lock; reads clone snapshots.
pub struct WorkingMemory {
    config: MemoryConfig,
    inner: RwLock<Inner>,
}

impl WorkingMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                terminal_tasks: HashSet::new(),
                total_bytes: 0,
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Insert or replace an entry, evicting lower-value entries if needed.
    pub fn set(
        &self,
        key: &str,
        description: &str,
        value: Value,
        opts: SetOptions,
    ) -> Result<(), MemoryError> {
        validate_key(key)?;
        if description.len() > self.config.description_max_length {
            return Err(MemoryError::DescriptionTooLong {
                len: description.len(),
                max: self.config.description_max_length,
            });
        }

        let size_bytes = serde_json::to_vec(&value)
            .map_err(|e| MemoryError::Storage(e.to_string()))?
            .len();
        if size_bytes > self.config.max_size_bytes {
            return Err(MemoryError::ValueTooLarge {
                size: size_bytes,
                max: self.config.max_size_bytes,
            });
        }

        let mut inner = self.inner.write().expect("memory lock poisoned");
        let replaced_bytes = inner.entries.get(key).map(|e| e.size_bytes).unwrap_or(0);

        if inner.total_bytes - replaced_bytes + size_bytes > self.config.max_size_bytes {
            Self::evict_to_fit(
                &mut inner,
                self.config.max_size_bytes,
                size_bytes,
                replaced_bytes,
                key,
            )?;
        }

        let now = Utc::now();
        let entry = MemoryEntry {
            key: key.to_string(),
            description: description.to_string(),
            value,
            size_bytes,
            scope: opts.scope.unwrap_or_default(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            priority: opts.priority,
            pinned: opts.pinned,
        };

        let replaced = inner.entries.insert(key.to_string(), entry);
        inner.total_bytes = inner.total_bytes - replaced.map(|e| e.size_bytes).unwrap_or(0)
            + size_bytes;
        inner.generation += 1;
        debug!(key, size_bytes, total = inner.total_bytes, "memory set");
        Ok(())
    }

    /// Eviction order: task-scope garbage first, then ascending effective
    /// priority, LRU within a band. Pinned entries are untouchable.
    fn evict_to_fit(
        inner: &mut Inner,
        max_bytes: usize,
        incoming_bytes: usize,
        replaced_bytes: usize,
        incoming_key: &str,
    ) -> Result<(), MemoryError> {
        let fits = |inner: &Inner| {
            inner.total_bytes - replaced_bytes + incoming_bytes <= max_bytes
        };

        let garbage: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.key != incoming_key && !e.pinned)
            .filter(|e| match &e.scope {
                Scope::Task { task_ids } => {
                    task_ids.iter().all(|id| inner.terminal_tasks.contains(id))
                }
                _ => false,
            })
            .map(|e| e.key.clone())
            .collect();
        for key in garbage {
            if fits(inner) {
                return Ok(());
            }
            Self::remove_entry(inner, &key);
        }

        let mut candidates: Vec<(Priority, chrono::DateTime<Utc>, String)> = inner
            .entries
            .values()
            .filter(|e| e.key != incoming_key && !e.pinned)
            .map(|e| (e.effective_priority(), e.last_accessed_at, e.key.clone()))
            .collect();
        candidates.sort();

        for (_, _, key) in candidates {
            if fits(inner) {
                return Ok(());
            }
            debug!(key = %key, "evicting memory entry");
            Self::remove_entry(inner, &key);
        }

        if fits(inner) {
            Ok(())
        } else {
            Err(MemoryError::Full {
                needed: incoming_bytes,
                available: max_bytes.saturating_sub(inner.total_bytes - replaced_bytes),
            })
        }
    }

    fn remove_entry(inner: &mut Inner, key: &str) -> Option<MemoryEntry> {
        let removed = inner.entries.remove(key);
        if let Some(ref e) = removed {
            inner.total_bytes -= e.size_bytes;
            inner.generation += 1;
        }
        removed
    }

    /// Fetch a value, bumping access stats. Missing keys are not an error.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.write().expect("memory lock poisoned");
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed_at = Utc::now();
        Some(entry.value.clone())
    }

    /// Fetch without touching access stats.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .expect("memory lock poisoned")
            .entries
            .get(key)
            .map(|e| e.value.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.read().expect("memory lock poisoned").entries.contains_key(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().expect("memory lock poisoned");
        Self::remove_entry(&mut inner, key).is_some()
    }

    pub fn pin(&self, key: &str) -> bool {
        self.set_pinned(key, true)
    }

    pub fn unpin(&self, key: &str) -> bool {
        self.set_pinned(key, false)
    }

    fn set_pinned(&self, key: &str, pinned: bool) -> bool {
        let mut guard = self.inner.write().expect("memory lock poisoned");
        let inner = &mut *guard;
        match inner.entries.get_mut(key) {
            Some(e) => {
                e.pinned = pinned;
                inner.generation += 1;
                true
            }
            None => false,
        }
    }

    /// Mutation counter for cache invalidation of derived views.
    pub fn generation(&self) -> u64 {
        self.inner.read().expect("memory lock poisoned").generation
    }

    /// Snapshot of every entry, sorted by key.
    pub fn list(&self) -> Vec<MemoryEntry> {
        let inner = self.inner.read().expect("memory lock poisoned");
        let mut entries: Vec<MemoryEntry> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn query(&self, filter: &QueryFilter) -> Vec<MemoryEntry> {
        self.list()
            .into_iter()
            .filter(|e| {
                filter.pattern.as_deref().is_none_or(|p| e.key.contains(p))
                    && filter.tier.is_none_or(|t| e.tier() == Some(t))
                    && filter.scope.as_ref().is_none_or(|s| &e.scope == s)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("memory lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size_bytes(&self) -> usize {
        self.inner.read().expect("memory lock poisoned").total_bytes
    }

    /// Index view for the system message: keys, descriptions, and sizes,
    /// grouped by priority (highest first), pinned entries leading each group.
    pub fn render_index(&self) -> String {
        let entries = self.list();
        if entries.is_empty() {
            return "Working memory is empty.".to_string();
        }

        let total = self.total_size_bytes();
        let mut out = format!(
            "Working memory: {} entries, {} / {} bytes",
            entries.len(),
            total,
            self.config.max_size_bytes
        );
        let pct = total * 100 / self.config.max_size_bytes.max(1);
        if pct >= self.config.soft_limit_percent as usize {
            out.push_str(&format!(" ({pct}% full — consider deleting entries)"));
        }
        out.push('\n');

        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            let mut group: Vec<&MemoryEntry> = entries
                .iter()
                .filter(|e| e.effective_priority() == priority)
                .collect();
            if group.is_empty() {
                continue;
            }
            group.sort_by_key(|e| (!e.pinned, e.key.clone()));
            out.push_str(&format!("\n[{priority:?}]\n").to_lowercase());
            for e in group {
                let pin = if e.pinned { " (pinned)" } else { "" };
                out.push_str(&format!(
                    "- {}{pin}: {} ({} bytes)\n",
                    e.key, e.description, e.size_bytes
                ));
            }
        }
        out
    }

    // --- scope lifecycle ---

    /// Note a task as terminal and drop task-scoped entries whose whole id
    /// set is now terminal.
    pub fn task_completed(&self, task_id: &str) {
        let mut inner = self.inner.write().expect("memory lock poisoned");
        inner.terminal_tasks.insert(task_id.to_string());
        let dead: Vec<String> = inner
            .entries
            .values()
            .filter(|e| match &e.scope {
                Scope::Task { task_ids } => {
                    task_ids.iter().all(|id| inner.terminal_tasks.contains(id))
                }
                _ => false,
            })
            .map(|e| e.key.clone())
            .collect();
        for key in &dead {
            Self::remove_entry(&mut inner, key);
        }
        if !dead.is_empty() {
            info!(task_id, dropped = dead.len(), "task-scoped memory cleared");
        }
    }

    pub fn plan_completed(&self) {
        self.clear_scope(|s| matches!(s, Scope::Plan));
    }

    pub fn session_end(&self) {
        self.clear_scope(|s| matches!(s, Scope::Session));
    }

    fn clear_scope(&self, dead: impl Fn(&Scope) -> bool) {
        let mut inner = self.inner.write().expect("memory lock poisoned");
        let keys: Vec<String> = inner
            .entries
            .values()
            .filter(|e| dead(&e.scope))
            .map(|e| e.key.clone())
            .collect();
        for key in keys {
            Self::remove_entry(&mut inner, &key);
        }
    }

    /// Replace the whole entry set, preserving entry metadata. Used by
    /// session restore.
    pub fn restore_entries(&self, entries: Vec<MemoryEntry>) {
        let mut inner = self.inner.write().expect("memory lock poisoned");
        inner.entries = entries.into_iter().map(|e| (e.key.clone(), e)).collect();
        inner.total_bytes = inner.entries.values().map(|e| e.size_bytes).sum();
        inner.generation += 1;
    }

    // --- persistence ---

    /// Write persistent-scoped entries to the storage backend.
    pub async fn persist(
        &self,
        storage: &dyn MemoryStorage,
        key: &str,
    ) -> Result<(), MemoryError> {
        let persistent: Vec<MemoryEntry> = self
            .list()
            .into_iter()
            .filter(|e| e.scope == Scope::Persistent)
            .collect();
        let doc = serde_json::to_value(&persistent)
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        storage.save(key, &doc).await
    }

    /// Load persistent entries back from the storage backend. Existing keys
    /// are overwritten; sizes are recomputed into the running total.
    pub async fn hydrate(
        &self,
        storage: &dyn MemoryStorage,
        key: &str,
    ) -> Result<usize, MemoryError> {
        let Some(doc) = storage.load(key).await? else {
            return Ok(0);
        };
        let entries: Vec<MemoryEntry> =
            serde_json::from_value(doc).map_err(|e| MemoryError::Storage(e.to_string()))?;
        let count = entries.len();
        let mut inner = self.inner.write().expect("memory lock poisoned");
        for entry in entries {
            let replaced = inner.entries.insert(entry.key.clone(), entry);
            if let Some(old) = replaced {
                inner.total_bytes -= old.size_bytes;
            }
        }
        inner.total_bytes = inner.entries.values().map(|e| e.size_bytes).sum();
        inner.generation += 1;
        Ok(count)
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_store(max: usize) -> WorkingMemory {
        WorkingMemory::new(MemoryConfig { max_size_bytes: max, ..Default::default() })
    }

    /// A JSON string value whose serialized form is exactly `bytes` long.
    fn blob(bytes: usize) -> Value {
        Value::String("x".repeat(bytes - 2))
    }

    #[test]
    fn set_get_roundtrip() {
        let mem = WorkingMemory::default();
        mem.set("answer", "the answer", json!(42), SetOptions::default()).unwrap();
        assert_eq!(mem.get("answer"), Some(json!(42)));
        assert!(mem.has("answer"));
        assert_eq!(mem.get("missing"), None);
    }

    #[test]
    fn get_touches_access_stats() {
        let mem = WorkingMemory::default();
        mem.set("k", "d", json!(1), SetOptions::default()).unwrap();
        mem.get("k");
        mem.get("k");
        let entry = &mem.list()[0];
        assert_eq!(entry.access_count, 2);
    }

    #[test]
    fn oversized_value_rejected_without_eviction() {
        let mem = small_store(100);
        mem.set("keep", "small", json!(1), SetOptions::default()).unwrap();
        let err = mem.set("big", "too big", blob(200), SetOptions::default()).unwrap_err();
        assert!(matches!(err, MemoryError::ValueTooLarge { .. }));
        assert!(mem.has("keep"));
    }

    #[test]
    fn eviction_under_pressure_drops_lowest_priority() {
        // max 1000: a(low,400) + b(high,400), then c(normal,400) → a evicted.
        let mem = small_store(1000);
        mem.set("a", "low", blob(400), SetOptions::priority(Priority::Low)).unwrap();
        mem.set("b", "high", blob(400), SetOptions::priority(Priority::High)).unwrap();
        mem.set("c", "normal", blob(400), SetOptions::priority(Priority::Normal)).unwrap();
        assert_eq!(mem.get("a"), None);
        assert!(mem.has("b"));
        assert!(mem.has("c"));
    }

    #[test]
    fn lru_within_priority_band() {
        let mem = small_store(1000);
        mem.set("old", "d", blob(400), SetOptions::default()).unwrap();
        mem.set("fresh", "d", blob(400), SetOptions::default()).unwrap();
        mem.get("old"); // now most recently accessed
        mem.set("new", "d", blob(400), SetOptions::default()).unwrap();
        assert!(mem.has("old"));
        assert!(!mem.has("fresh"));
    }

    #[test]
    fn pinned_never_evicted() {
        let mem = small_store(1000);
        mem.set("keep", "pinned", blob(600), SetOptions::pinned()).unwrap();
        let err = mem.set("next", "d", blob(600), SetOptions::default()).unwrap_err();
        assert!(matches!(err, MemoryError::Full { .. }));
        assert!(mem.has("keep"));
    }

    #[test]
    fn terminal_task_garbage_evicted_first() {
        let mem = small_store(1000);
        mem.task_completed("t1");
        // Scoped to an already-terminal task: garbage from the start.
        mem.set(
            "garbage",
            "dead task data",
            blob(400),
            SetOptions {
                scope: Some(Scope::Task { task_ids: vec!["t1".into()] }),
                // Even critical priority loses to garbage collection order.
                priority: Some(Priority::Critical),
                pinned: false,
            },
        )
        .unwrap();
        mem.set("live", "d", blob(400), SetOptions::priority(Priority::Low)).unwrap();
        mem.set("more", "d", blob(400), SetOptions::default()).unwrap();
        assert!(!mem.has("garbage"));
        assert!(mem.has("live"));
        assert!(mem.has("more"));
    }

    #[test]
    fn task_scope_dropped_only_when_all_ids_terminal() {
        let mem = WorkingMemory::default();
        mem.set(
            "shared",
            "two tasks",
            json!(1),
            SetOptions::scope(Scope::Task { task_ids: vec!["t1".into(), "t2".into()] }),
        )
        .unwrap();
        mem.task_completed("t1");
        assert!(mem.has("shared"));
        mem.task_completed("t2");
        assert!(!mem.has("shared"));
    }

    #[test]
    fn scope_cleanup_on_plan_and_session() {
        let mem = WorkingMemory::default();
        mem.set("s", "d", json!(1), SetOptions::default()).unwrap();
        mem.set("p", "d", json!(1), SetOptions::scope(Scope::Plan)).unwrap();
        mem.set("keep", "d", json!(1), SetOptions::scope(Scope::Persistent)).unwrap();
        mem.plan_completed();
        assert!(!mem.has("p"));
        assert!(mem.has("s"));
        mem.session_end();
        assert!(!mem.has("s"));
        assert!(mem.has("keep"));
    }

    #[test]
    fn description_length_boundary() {
        let mem = WorkingMemory::default();
        let max = mem.config().description_max_length;
        mem.set("ok", &"d".repeat(max), json!(1), SetOptions::default()).unwrap();
        let err = mem.set("no", &"d".repeat(max + 1), json!(1), SetOptions::default());
        assert!(matches!(err, Err(MemoryError::DescriptionTooLong { .. })));
    }

    #[test]
    fn bad_keys_rejected() {
        let mem = WorkingMemory::default();
        assert!(matches!(
            mem.set("a..b", "d", json!(1), SetOptions::default()),
            Err(MemoryError::KeyFormat { .. })
        ));
    }

    #[test]
    fn size_invariant_holds_after_replacement() {
        let mem = small_store(1000);
        mem.set("k", "d", blob(400), SetOptions::default()).unwrap();
        mem.set("k", "d", blob(100), SetOptions::default()).unwrap();
        assert_eq!(mem.total_size_bytes(), 100);
        assert!(mem.total_size_bytes() <= 1000);
    }

    #[test]
    fn query_filters_compose() {
        let mem = WorkingMemory::default();
        mem.set("raw.page", "d", json!(1), SetOptions::default()).unwrap();
        mem.set("findings.api", "d", json!(2), SetOptions::default()).unwrap();
        mem.set("plain", "d", json!(3), SetOptions::scope(Scope::Plan)).unwrap();

        assert_eq!(mem.query(&QueryFilter { tier: Some(Tier::Raw), ..Default::default() }).len(), 1);
        assert_eq!(
            mem.query(&QueryFilter { pattern: Some("api".into()), ..Default::default() }).len(),
            1
        );
        assert_eq!(
            mem.query(&QueryFilter { scope: Some(Scope::Plan), ..Default::default() }).len(),
            1
        );
    }

    #[test]
    fn index_groups_by_priority_pinned_first() {
        let mem = WorkingMemory::default();
        mem.set("findings.core", "important", json!(1), SetOptions::default()).unwrap();
        mem.set(
            "anchor",
            "pinned entry",
            json!(2),
            SetOptions { pinned: true, priority: Some(Priority::High), scope: None },
        )
        .unwrap();
        mem.set("raw.dump", "scratch", json!(3), SetOptions::default()).unwrap();

        let index = mem.render_index();
        let anchor_pos = index.find("anchor").unwrap();
        let findings_pos = index.find("findings.core").unwrap();
        let raw_pos = index.find("raw.dump").unwrap();
        assert!(anchor_pos < findings_pos, "pinned leads its group:\n{index}");
        assert!(findings_pos < raw_pos, "high before low:\n{index}");
    }

    #[tokio::test]
    async fn persistent_entries_roundtrip_through_storage() {
        use super::super::storage::FileMemoryStorage;
        let dir = tempfile::tempdir().unwrap();
        let storage = FileMemoryStorage::new(dir.path());

        let mem = WorkingMemory::default();
        mem.set("keep", "survives", json!({"a": 1}), SetOptions::scope(Scope::Persistent))
            .unwrap();
        mem.set("drop", "session only", json!(2), SetOptions::default()).unwrap();
        mem.persist(&storage, "user1/mem").await.unwrap();

        let fresh = WorkingMemory::default();
        let loaded = fresh.hydrate(&storage, "user1/mem").await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(fresh.peek("keep"), Some(json!({"a": 1})));
        assert!(!fresh.has("drop"));
    }
}
