use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OnceCell};

use crate::error::AgentError;
use crate::tools::Tool;

/// Name-keyed registry with deduplicated lazy construction: the first
/// `get_or_init` for a name holds the cell, concurrent callers await the
/// same construction, and nothing is built twice.
pub struct LazyRegistry<T: ?Sized + Send + Sync + 'static> {
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<T>>>>>,
}

impl<T: ?Sized + Send + Sync + 'static> LazyRegistry<T> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Fetch `name`, constructing it with `init` on first access. The map
    /// lock is held only to find the cell; construction runs outside it so
    /// slow factories don't serialize unrelated entries.
    pub async fn get_or_init<F, Fut>(&self, name: &str, init: F) -> Result<Arc<T>, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, AgentError>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.entry(name.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        cell.get_or_try_init(init).await.cloned()
    }

    /// Insert a ready-made entry. Replaces any existing entry of that name.
    pub async fn register(&self, name: &str, value: Arc<T>) {
        let cell = OnceCell::new();
        let _ = cell.set(value);
        self.entries.lock().await.insert(name.to_string(), Arc::new(cell));
    }

    /// Fetch without constructing.
    pub async fn get(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.lock().await;
        entries.get(name).and_then(|cell| cell.get().cloned())
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.entries.lock().await.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Tear down every entry.
    pub async fn destroy(&self) {
        self.entries.lock().await.clear();
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for LazyRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An authenticated HTTP client for one remote service. Internals live
/// outside the core; the registry only needs the seam.
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;
    fn base_url(&self) -> &str;
    fn client(&self) -> &reqwest::Client;
}

/// Produces a named family of tools, typically bound to a connector.
pub trait ToolFactory: Send + Sync {
    fn name(&self) -> &str;
    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

static CONNECTORS: Lazy<LazyRegistry<dyn Connector>> = Lazy::new(LazyRegistry::new);
static TOOL_FACTORIES: Lazy<LazyRegistry<dyn ToolFactory>> = Lazy::new(LazyRegistry::new);

/// The process-wide connector registry.
pub fn connectors() -> &'static LazyRegistry<dyn Connector> {
    &CONNECTORS
}

/// The process-wide tool-factory registry.
pub fn tool_factories() -> &'static LazyRegistry<dyn ToolFactory> {
    &TOOL_FACTORIES
}
