use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::AgentError;
use crate::estimate::TokenEstimator;
use crate::tools::Tool;

/// A component that contributes to the prepared context: static
/// instructions (never compacted), dynamic content (compactable), tools,
/// and a serializable state snapshot for session save/restore.
///
/// All methods take `&self`; plugins use interior mutability so they can be
/// shared with the tool layer.
pub trait ContextPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Static block for the system message. Never compacted.
    fn instructions(&self) -> Option<String> {
        None
    }

    /// Dynamic block for the system message. May be compacted.
    fn content(&self) -> Option<String> {
        None
    }

    /// Raw underlying data, for inspection.
    fn raw_contents(&self) -> Value {
        Value::Null
    }

    /// Token size of `content()`. Implementations cache this and invalidate
    /// on mutation.
    fn token_size(&self, estimator: &dyn TokenEstimator) -> u32 {
        self.content().map(|c| estimator.estimate_text(&c)).unwrap_or(0)
    }

    /// Token size of `instructions()`.
    fn instructions_token_size(&self, estimator: &dyn TokenEstimator) -> u32 {
        self.instructions().map(|i| estimator.estimate_text(&i)).unwrap_or(0)
    }

    fn is_compactable(&self) -> bool {
        false
    }

    /// Best-effort: free up to `target_tokens` from the dynamic content.
    /// Returns the tokens actually freed.
    fn compact(&self, _target_tokens: u32) -> u32 {
        0
    }

    /// Plugins with higher compaction priority are compacted first.
    fn compaction_priority(&self) -> u8 {
        50
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }

    /// Serializable snapshot for session persistence. Must round-trip
    /// through `restore_state`.
    fn state(&self) -> Value;

    fn restore_state(&self, state: &Value) -> Result<(), AgentError>;

    fn destroy(&self) {}
}

/// Generation-keyed token cache. `get_or` recomputes only when the caller's
/// generation has moved.
#[derive(Default)]
pub struct TokenCache {
    cached: Mutex<Option<(u64, u32)>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or(&self, generation: u64, compute: impl FnOnce() -> u32) -> u32 {
        let mut slot = self.cached.lock().expect("token cache lock poisoned");
        if let Some((cached_gen, tokens)) = *slot {
            if cached_gen == generation {
                return tokens;
            }
        }
        let tokens = compute();
        *slot = Some((generation, tokens));
        tokens
    }

    pub fn invalidate(&self) {
        *self.cached.lock().expect("token cache lock poisoned") = None;
    }
}
