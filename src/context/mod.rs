pub mod budget;
pub mod plugin;
pub mod plugins;
pub mod strategy;

pub use budget::TokenBudget;
pub use plugin::{ContextPlugin, TokenCache};
pub use plugins::{
    InContextMemoryPlugin, PersistentInstructionsPlugin, TodoPlugin, UserInfoPlugin,
    WorkingMemoryPlugin,
};
pub use strategy::{
    AlgorithmicStrategy, CompactionReport, CompactionStrategy, ConsolidationReport,
    StrategyContext,
};

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::estimate::{HeuristicEstimator, TokenEstimator};
use crate::events::{EventBus, RuntimeEvent};
use crate::types::{ConversationMessage, InferenceRequest, InferenceResponse, MessagePart, Role};

/// Context-manager settings.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub model: String,
    pub max_context_tokens: u32,
    /// Tokens held back for the model's output.
    pub response_reserve: u32,
    /// Most recent messages the compaction strategy may never touch.
    pub protect_recent: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            max_context_tokens: 200_000,
            response_reserve: 4096,
            protect_recent: 4,
        }
    }
}

/// The exact bounded input for one provider call.
#[derive(Debug)]
pub struct PreparedContext {
    pub request: InferenceRequest,
    pub budget: TokenBudget,
    pub compacted: bool,
    pub compaction_log: Vec<String>,
}

/// Owns everything the LLM sees: the conversation, the plugin list, token
/// caches, and the compaction policy. The ONE place context decisions happen.
pub struct ContextManager {
    config: ContextConfig,
    system_prompt: Option<String>,
    conversation: Vec<ConversationMessage>,
    plugins: Vec<Arc<dyn ContextPlugin>>,
    estimator: Box<dyn TokenEstimator>,
    strategy: Box<dyn CompactionStrategy>,
    tool_schemas: Vec<Value>,
    tools_tokens: Option<u32>,
    events: EventBus,
    destroyed: bool,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            system_prompt: None,
            conversation: Vec::new(),
            plugins: Vec::new(),
            estimator: Box::new(HeuristicEstimator),
            strategy: Box::new(AlgorithmicStrategy::new()),
            tool_schemas: Vec::new(),
            tools_tokens: None,
            events: EventBus::new(),
            destroyed: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    pub fn with_strategy(mut self, strategy: impl CompactionStrategy + 'static) -> Self {
        self.set_strategy(strategy);
        self
    }

    pub fn set_strategy(&mut self, strategy: impl CompactionStrategy + 'static) {
        for required in strategy.required_plugins() {
            if !self.plugins.iter().any(|p| p.name() == required) {
                warn!(strategy = strategy.name(), plugin = required, "required plugin not registered");
            }
        }
        self.strategy = Box::new(strategy);
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Plugins contribute in registration order.
    pub fn register_plugin(&mut self, plugin: Arc<dyn ContextPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<dyn ContextPlugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn plugins(&self) -> &[Arc<dyn ContextPlugin>] {
        &self.plugins
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    /// Replace the tool definitions sent with every request. Invalidates the
    /// cached tool token count.
    pub fn set_tool_schemas(&mut self, schemas: Vec<Value>) {
        self.tool_schemas = schemas;
        self.tools_tokens = None;
    }

    pub fn conversation(&self) -> &[ConversationMessage] {
        &self.conversation
    }

    /// Assembled system message: system prompt, then each plugin's
    /// instructions, then each plugin's content, in registration order.
    fn assemble_system(&self) -> Option<String> {
        let mut blocks: Vec<String> = Vec::new();
        if let Some(ref prompt) = self.system_prompt {
            blocks.push(prompt.clone());
        }
        for plugin in &self.plugins {
            if let Some(instructions) = plugin.instructions() {
                blocks.push(instructions);
            }
        }
        for plugin in &self.plugins {
            if let Some(content) = plugin.content() {
                blocks.push(content);
            }
        }
        if blocks.is_empty() {
            None
        } else {
            Some(blocks.join("\n\n"))
        }
    }

    fn message_tokens(&self, msg: &ConversationMessage) -> u32 {
        serde_json::to_value(msg)
            .map(|v| self.estimator.estimate_data(&v))
            .unwrap_or(0)
    }

    fn conversation_tokens(&self) -> u32 {
        self.conversation.iter().map(|m| self.message_tokens(m)).sum()
    }

    fn tools_tokens(&mut self) -> u32 {
        if let Some(tokens) = self.tools_tokens {
            return tokens;
        }
        let tokens = self
            .tool_schemas
            .iter()
            .map(|s| self.estimator.estimate_data(s))
            .sum();
        self.tools_tokens = Some(tokens);
        tokens
    }

    fn compute_budget(&mut self, system: Option<&str>, current_input: &[ConversationMessage]) -> TokenBudget {
        TokenBudget {
            max_tokens: self.config.max_context_tokens,
            response_reserve: self.config.response_reserve,
            system_message: system.map(|s| self.estimator.estimate_text(s)).unwrap_or(0),
            tools: self.tools_tokens(),
            conversation: self.conversation_tokens(),
            current_input: current_input.iter().map(|m| self.message_tokens(m)).sum(),
        }
    }

    /// Produce the bounded input for the next provider call. `current_input`
    /// is the not-yet-committed message(s) for this turn — the user prompt
    /// or the pending tool results.
    pub fn prepare(
        &mut self,
        current_input: &[ConversationMessage],
    ) -> Result<PreparedContext, AgentError> {
        if self.destroyed {
            return Err(AgentError::Destroyed);
        }

        let system = self.assemble_system();
        let mut input: Vec<ConversationMessage> = current_input.to_vec();
        let mut budget = self.compute_budget(system.as_deref(), &input);

        // Oversized current input: truncate to whatever the window leaves
        // after system + tools + reserve, then reject if it still overflows.
        let input_allowance = budget
            .max_tokens
            .saturating_sub(budget.response_reserve)
            .saturating_sub(budget.system_message)
            .saturating_sub(budget.tools);
        if budget.current_input > input_allowance {
            let before = budget.current_input;
            truncate_message_texts(&mut input, input_allowance, self.estimator.as_ref());
            budget.current_input = input.iter().map(|m| self.message_tokens(m)).sum();
            self.events.publish(RuntimeEvent::InputOversized {
                tokens: before,
                truncated_to: budget.current_input,
            });
            if budget.current_input > input_allowance {
                return Err(AgentError::InputTooLarge {
                    tokens: budget.current_input,
                    available: input_allowance,
                });
            }
        }

        // Compaction gate.
        let mut compacted = false;
        let mut compaction_log = Vec::new();
        let threshold = self.strategy.threshold();
        if !budget.fits() || budget.utilization() >= threshold {
            let usable = budget.max_tokens.saturating_sub(budget.response_reserve);
            let below_threshold_target = budget
                .total_used()
                .saturating_sub((threshold * usable as f32) as u32);
            let target = budget.overflow().max(below_threshold_target).max(1);

            self.events.publish(RuntimeEvent::CompactionStarting { target_to_free: target });
            let report = {
                let mut ctx = StrategyContext::new(
                    &mut self.conversation,
                    &input,
                    &self.plugins,
                    self.estimator.as_ref(),
                    self.config.protect_recent,
                );
                self.strategy.compact(&mut ctx, target)
            };
            compacted = true;
            compaction_log = report.log.clone();
            self.events.publish(RuntimeEvent::ContextCompacted {
                tokens_freed: report.tokens_freed,
                log: report.log,
            });

            // Plugin content may have changed; rebuild the system message.
            let system = self.assemble_system();
            budget = self.compute_budget(system.as_deref(), &input);
        }

        if !budget.fits() {
            // Nothing more can be freed; proceed with the minimum feasible
            // context and let the caller observe the exhaustion.
            self.events.publish(RuntimeEvent::ContextExhausted { deficit: budget.overflow() });
            warn!(deficit = budget.overflow(), "context exhausted after compaction");
        }

        let utilization = budget.utilization();
        self.events.publish(RuntimeEvent::BudgetUpdated { budget });
        if utilization > 0.9 {
            self.events.publish(RuntimeEvent::BudgetCritical { utilization });
        } else if utilization > 0.7 {
            self.events.publish(RuntimeEvent::BudgetWarning { utilization });
        }
        self.events.publish(RuntimeEvent::ContextPrepared {
            total_used: budget.total_used(),
            available: budget.available(),
        });

        let system = self.assemble_system();
        let mut messages = self.conversation.clone();
        messages.extend(input);

        debug!(
            total_used = budget.total_used(),
            available = budget.available(),
            compacted,
            "context prepared"
        );

        Ok(PreparedContext {
            request: InferenceRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.response_reserve,
                temperature: None,
                system,
                tools: self.tool_schemas.clone(),
                messages,
            },
            budget,
            compacted,
            compaction_log,
        })
    }

    /// Fold the turn's input into the conversation once the provider call is
    /// underway.
    pub fn commit_input(&mut self, input: Vec<ConversationMessage>) {
        for msg in input {
            self.events.publish(RuntimeEvent::MessageAdded { role: role_name(msg.role) });
            self.conversation.push(msg);
        }
    }

    pub fn push_assistant(&mut self, response: &InferenceResponse) {
        self.events.publish(RuntimeEvent::MessageAdded { role: "assistant" });
        self.conversation.push(ConversationMessage::assistant(response.content.clone()));
    }

    pub fn clear_conversation(&mut self) {
        self.conversation.clear();
        self.events.publish(RuntimeEvent::ConversationCleared);
    }

    /// Post-cycle consolidation through the active strategy.
    pub fn consolidate(&mut self) -> ConsolidationReport {
        let mut ctx = StrategyContext::new(
            &mut self.conversation,
            &[],
            &self.plugins,
            self.estimator.as_ref(),
            self.config.protect_recent,
        );
        self.strategy.consolidate(&mut ctx)
    }

    /// Conversation + system prompt, for session persistence. Plugin states
    /// are collected separately so each plugin's blob stays under its name.
    pub fn snapshot(&self) -> Value {
        json!({
            "conversation": &self.conversation,
            "system_prompt": &self.system_prompt,
        })
    }

    pub fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError> {
        self.conversation = serde_json::from_value(snapshot["conversation"].clone())
            .map_err(|e| AgentError::Context(format!("bad conversation snapshot: {e}")))?;
        self.system_prompt = snapshot["system_prompt"].as_str().map(String::from);
        Ok(())
    }

    pub fn plugin_states(&self) -> Value {
        let mut states = serde_json::Map::new();
        for plugin in &self.plugins {
            states.insert(plugin.name().to_string(), plugin.state());
        }
        Value::Object(states)
    }

    pub fn restore_plugin_states(&mut self, states: &Value) -> Result<(), AgentError> {
        let Some(map) = states.as_object() else {
            return Err(AgentError::Context("plugin states must be an object".into()));
        };
        for plugin in &self.plugins {
            if let Some(state) = map.get(plugin.name()) {
                plugin.restore_state(state)?;
            }
        }
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Idempotent teardown: plugin destroy, caches and subscribers cleared.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for plugin in &self.plugins {
            plugin.destroy();
        }
        self.conversation.clear();
        self.tools_tokens = None;
        self.events.clear();
        self.destroyed = true;
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

/// Trim text and tool-result bodies until the messages fit the allowance.
/// Later parts are cut first; a marker notes the truncation.
fn truncate_message_texts(
    messages: &mut [ConversationMessage],
    allowance_tokens: u32,
    estimator: &dyn TokenEstimator,
) {
    const MARKER: &str = "…[truncated to fit context]";
    let mut over = {
        let total: u32 = messages
            .iter()
            .map(|m| serde_json::to_value(m).map(|v| estimator.estimate_data(&v)).unwrap_or(0))
            .sum();
        total.saturating_sub(allowance_tokens)
    };
    if over == 0 {
        return;
    }
    // Body text is cut at the chars/token heuristic, which does not see the
    // serialization overhead or the marker itself; overshoot to compensate.
    over += 64;

    for msg in messages.iter_mut().rev() {
        for part in msg.parts.iter_mut().rev() {
            if over == 0 {
                return;
            }
            let body = match part {
                MessagePart::Text { text } => text,
                MessagePart::ToolResult { content, .. } => content,
                MessagePart::ToolUse { .. } => continue,
            };
            let body_tokens = estimator.estimate_text(body);
            let cut_tokens = body_tokens.min(over);
            let keep_chars = body.len().saturating_sub((cut_tokens as usize) * 4);
            // Cut on a char boundary.
            let keep_chars = (0..=keep_chars)
                .rev()
                .find(|&i| body.is_char_boundary(i))
                .unwrap_or(0);
            body.truncate(keep_chars);
            body.push_str(MARKER);
            over = over.saturating_sub(cut_tokens);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopReason;
    use crate::types::Usage;

    fn manager(max: u32, reserve: u32) -> ContextManager {
        ContextManager::new(ContextConfig {
            model: "test-model".into(),
            max_context_tokens: max,
            response_reserve: reserve,
            protect_recent: 4,
        })
    }

    #[test]
    fn prepare_assembles_system_in_registration_order() {
        let mut ctx = manager(200_000, 4096).with_system_prompt("Base prompt.");
        let a = Arc::new(PersistentInstructionsPlugin::new());
        a.add("First instruction.");
        let b = Arc::new(UserInfoPlugin::new());
        b.set("name", "Ada");
        ctx.register_plugin(a);
        ctx.register_plugin(b);

        let prepared = ctx.prepare(&[ConversationMessage::user("hi")]).unwrap();
        let system = prepared.request.system.unwrap();
        let base = system.find("Base prompt.").unwrap();
        let instr = system.find("First instruction.").unwrap();
        let info = system.find("Ada").unwrap();
        assert!(base < instr && instr < info, "{system}");
    }

    #[test]
    fn budget_breakdown_sums() {
        let mut ctx = manager(200_000, 4096).with_system_prompt("prompt");
        ctx.set_tool_schemas(vec![json!({"name": "echo", "description": "Echo tool"})]);
        ctx.commit_input(vec![ConversationMessage::user("earlier message")]);

        let prepared = ctx.prepare(&[ConversationMessage::user("current")]).unwrap();
        let b = prepared.budget;
        assert_eq!(b.total_used(), b.system_message + b.tools + b.conversation + b.current_input);
        assert!(b.tools > 0);
        assert!(b.conversation > 0);
        assert!(b.current_input > 0);
        assert!(b.fits());
    }

    #[test]
    fn prepare_appends_current_input_after_conversation() {
        let mut ctx = manager(200_000, 4096);
        ctx.commit_input(vec![ConversationMessage::user("first")]);
        let prepared = ctx.prepare(&[ConversationMessage::user("second")]).unwrap();
        assert_eq!(prepared.request.messages.len(), 2);
        assert_eq!(prepared.request.messages[1].text(), "second");
        // prepare itself does not commit.
        assert_eq!(ctx.conversation().len(), 1);
    }

    #[test]
    fn oversized_input_truncated_and_flagged() {
        let mut ctx = manager(1000, 100);
        let mut oversized = ctx.events().subscribe_to("input:oversized");

        let big = "x".repeat(10_000); // ~2500 tokens >> 900 allowance
        let prepared = ctx.prepare(&[ConversationMessage::user(big)]).unwrap();
        assert!(prepared.budget.current_input <= 900);
        let text = prepared.request.messages[0].text();
        assert!(text.contains("truncated"), "truncation marker missing");
        assert!(matches!(oversized.try_recv().unwrap(), RuntimeEvent::InputOversized { .. }));
    }

    #[test]
    fn compaction_gate_fires_over_threshold() {
        let mut ctx = manager(2000, 100);
        let mut compacted_events = ctx.events().subscribe_to("context:compacted");

        // Fill conversation well past 80% of the usable window with old
        // cycles the strategy may remove.
        for i in 0..12 {
            ctx.commit_input(vec![ConversationMessage::user(format!(
                "message {i}: {}",
                "pad ".repeat(150)
            ))]);
        }
        let prepared = ctx.prepare(&[ConversationMessage::user("now")]).unwrap();
        assert!(prepared.compacted);
        assert!(!prepared.compaction_log.is_empty());
        assert!(matches!(
            compacted_events.try_recv().unwrap(),
            RuntimeEvent::ContextCompacted { .. }
        ));
        // Invariant: fits, or exhaustion was signalled.
        assert!(prepared.budget.fits());
    }

    #[test]
    fn prepare_invariant_or_exhausted_event() {
        let mut ctx = manager(300, 100);
        let mut exhausted = ctx.events().subscribe_to("context:exhausted");
        // Protected recent messages can exceed the tiny window; compaction
        // can't touch them, so prepare signals exhaustion.
        for _ in 0..4 {
            ctx.commit_input(vec![ConversationMessage::user("word ".repeat(60))]);
        }
        let prepared = ctx.prepare(&[]).unwrap();
        if !prepared.budget.fits() {
            assert!(matches!(
                exhausted.try_recv().unwrap(),
                RuntimeEvent::ContextExhausted { .. }
            ));
        }
    }

    #[test]
    fn tool_token_cache_invalidated_on_change() {
        let mut ctx = manager(200_000, 4096);
        ctx.set_tool_schemas(vec![json!({"name": "a", "description": "A tool"})]);
        let first = ctx.prepare(&[]).unwrap().budget.tools;
        ctx.set_tool_schemas(vec![
            json!({"name": "a", "description": "A tool"}),
            json!({"name": "b", "description": "Another tool with a longer description"}),
        ]);
        let second = ctx.prepare(&[]).unwrap().budget.tools;
        assert!(second > first);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut ctx = manager(200_000, 4096).with_system_prompt("You are helpful.");
        ctx.commit_input(vec![ConversationMessage::user("hello")]);
        ctx.push_assistant(&InferenceResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![MessagePart::text("hi there")],
            usage: Usage::default(),
        });

        let snap = ctx.snapshot();
        let mut restored = manager(200_000, 4096);
        restored.restore(&snap).unwrap();
        assert_eq!(restored.conversation().len(), 2);
        assert_eq!(restored.conversation()[1].text(), "hi there");
        let prepared = restored.prepare(&[]).unwrap();
        assert_eq!(prepared.request.system.as_deref(), Some("You are helpful."));
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut ctx = manager(200_000, 4096);
        ctx.commit_input(vec![ConversationMessage::user("hello")]);
        ctx.destroy();
        ctx.destroy();
        assert!(ctx.is_destroyed());
        assert!(matches!(ctx.prepare(&[]), Err(AgentError::Destroyed)));
    }

    #[test]
    fn clear_conversation_emits_event() {
        let mut ctx = manager(200_000, 4096);
        let mut cleared = ctx.events().subscribe_to("conversation:cleared");
        ctx.commit_input(vec![ConversationMessage::user("hello")]);
        ctx.clear_conversation();
        assert!(ctx.conversation().is_empty());
        assert!(matches!(cleared.try_recv().unwrap(), RuntimeEvent::ConversationCleared));
    }
}
