use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::TokenBudget;

/// Everything observable about a running agent, for UIs and telemetry.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    // Context lifecycle
    ContextPrepared { total_used: u32, available: u32 },
    ContextCompacted { tokens_freed: u32, log: Vec<String> },
    ContextExhausted { deficit: u32 },
    BudgetUpdated { budget: TokenBudget },
    BudgetWarning { utilization: f32 },
    BudgetCritical { utilization: f32 },
    InputOversized { tokens: u32, truncated_to: u32 },
    CompactionStarting { target_to_free: u32 },
    MessageAdded { role: &'static str },
    ConversationCleared,

    // Agent loop
    IterationStart { iteration: usize },
    Text { content: String },
    ToolCall { name: String, input: Value },
    ToolResult { name: String, output: String, is_error: bool },
    Finished { iterations: usize },

    // Routine execution
    TaskStarted { task_id: String, attempt: u32 },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, reason: String },
    PlanCompleted { plan_id: String, failed_tasks: usize },
}

impl RuntimeEvent {
    /// Stable event-name key used for filtered subscriptions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContextPrepared { .. } => "context:prepared",
            Self::ContextCompacted { .. } => "context:compacted",
            Self::ContextExhausted { .. } => "context:exhausted",
            Self::BudgetUpdated { .. } => "budget:updated",
            Self::BudgetWarning { .. } => "budget:warning",
            Self::BudgetCritical { .. } => "budget:critical",
            Self::InputOversized { .. } => "input:oversized",
            Self::CompactionStarting { .. } => "compaction:starting",
            Self::MessageAdded { .. } => "message:added",
            Self::ConversationCleared => "conversation:cleared",
            Self::IterationStart { .. } => "iteration:start",
            Self::Text { .. } => "output:text",
            Self::ToolCall { .. } => "tool:call",
            Self::ToolResult { .. } => "tool:result",
            Self::Finished { .. } => "run:finished",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::PlanCompleted { .. } => "plan:completed",
        }
    }
}

struct Subscriber {
    filter: Option<&'static str>,
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

/// Process-local publish/subscribe bus. Delivery is FIFO per subscriber;
/// publishing never blocks (unbounded channels). No ordering is guaranteed
/// across different subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RuntimeEvent> {
        self.subscribe_inner(None)
    }

    /// Subscribe to one event kind, e.g. `"context:compacted"`.
    pub fn subscribe_to(&self, kind: &'static str) -> mpsc::UnboundedReceiver<RuntimeEvent> {
        self.subscribe_inner(Some(kind))
    }

    fn subscribe_inner(&self, filter: Option<&'static str>) -> mpsc::UnboundedReceiver<RuntimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscriber { filter, tx });
        rx
    }

    pub fn publish(&self, event: RuntimeEvent) {
        let mut subs = self.subscribers.lock().expect("event bus lock poisoned");
        // Dropped receivers are pruned as we go.
        subs.retain(|s| {
            if let Some(filter) = s.filter {
                if filter != event.kind() {
                    return !s.tx.is_closed();
                }
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    /// Drop every subscription. Used by `destroy()`.
    pub fn clear(&self) {
        self.subscribers.lock().expect("event bus lock poisoned").clear();
    }
}
