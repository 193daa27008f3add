pub mod context;
pub mod error;
pub mod estimate;
pub mod events;
pub mod hooks;
pub mod inference;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod routine;
pub mod session;
pub mod stream;
pub mod tools;
pub mod types;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use context::{
    AlgorithmicStrategy, CompactionStrategy, ContextConfig, ContextManager, ContextPlugin,
    InContextMemoryPlugin, PersistentInstructionsPlugin, PreparedContext, TodoPlugin, TokenBudget,
    UserInfoPlugin, WorkingMemoryPlugin,
};
pub use error::{AgentError, InferenceError, MemoryError, PlanError, ToolError};
pub use estimate::{HeuristicEstimator, ImageDetail, TokenEstimator};
pub use events::{EventBus, RuntimeEvent};
pub use hooks::{FnHook, Hook, HookDirective, HookEvent, HookId, HookPoint, HookRegistry};
pub use inference::AnthropicProvider;
pub use memory::{MemoryConfig, Priority, QueryFilter, Scope, SetOptions, Tier, WorkingMemory};
pub use provider::InferenceProvider;
pub use routine::{
    Concurrency, ConcurrencyStrategy, Condition, ConditionOp, ControlFlow, ExecutorConfig,
    ExternalDependency, FailureMode, Plan, PlanStatus, PlanUpdate, RoutineExecutor, RoutineOutcome,
    Task, TaskSpec, TaskStatus,
};
pub use session::{FileSessionManager, NoSessionManager, SessionDocument, SessionManager};
pub use stream::{StreamConverter, StreamEvent};
pub use tools::{Tool, ToolContext, ToolDefinition, ToolRegistry};
pub use types::{
    ConversationMessage, InferenceRequest, InferenceResponse, MessagePart, Role, StopReason, Usage,
};

use hooks::{HookDirective as Directive, HookEvent as Event, HookPoint as Point};
use session::SessionMetadata;
use types::ConversationMessage as Message;

/// Which bundled plugins a new agent gets.
#[derive(Debug, Clone)]
pub struct ContextFeatures {
    pub working_memory: bool,
    pub in_context_memory: bool,
    pub persistent_instructions: bool,
    pub user_info: bool,
    pub todo: bool,
}

impl Default for ContextFeatures {
    fn default() -> Self {
        Self {
            working_memory: true,
            in_context_memory: true,
            persistent_instructions: false,
            user_info: false,
            todo: false,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_context_tokens: u32,
    /// Tokens reserved for the model's output on each call.
    pub response_reserve: u32,
    /// Reasoning/tool cycles per `run` before giving up.
    pub max_iterations: usize,
    pub temperature: Option<f32>,
    /// 0 disables the per-tool-call timeout.
    pub tool_execution_timeout_ms: u64,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub account_id: Option<String>,
    pub features: ContextFeatures,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            max_context_tokens: 200_000,
            response_reserve: 4096,
            max_iterations: 50,
            temperature: None,
            tool_execution_timeout_ms: 0,
            session_id: None,
            agent_id: None,
            user_id: None,
            account_id: None,
            features: ContextFeatures::default(),
        }
    }
}

/// Result of an agent invocation.
#[derive(Debug)]
pub struct AgentResult {
    pub output_text: String,
    pub output_items: Vec<MessagePart>,
    pub usage: Usage,
    pub iterations: usize,
}

/// The LLM-driven reasoning loop: owns a context manager (and through it the
/// plugins), a tool registry, hooks, and a cancellation token. Wire up a
/// provider and go.
pub struct Agent {
    provider: Box<dyn InferenceProvider>,
    context: ContextManager,
    tools: ToolRegistry,
    hooks: HookRegistry,
    session: Box<dyn SessionManager>,
    memory: Arc<WorkingMemory>,
    in_context: Arc<InContextMemoryPlugin>,
    events: EventBus,
    cancel: CancellationToken,
    config: AgentConfig,
    destroyed: bool,
}

impl Agent {
    pub fn new(provider: impl InferenceProvider + 'static, config: AgentConfig) -> Self {
        let events = EventBus::new();
        let memory = Arc::new(WorkingMemory::default());
        let mut context = ContextManager::new(ContextConfig {
            model: config.model.clone(),
            max_context_tokens: config.max_context_tokens,
            response_reserve: config.response_reserve,
            protect_recent: 4,
        })
        .with_events(events.clone());

        let mut tools = ToolRegistry::new().with_timeout_ms(config.tool_execution_timeout_ms);
        let in_context = Arc::new(InContextMemoryPlugin::new());

        if config.features.working_memory {
            let plugin = Arc::new(WorkingMemoryPlugin::new(memory.clone()));
            for tool in plugin.tools() {
                tools.register(tool).expect("bundled tool registration");
            }
            context.register_plugin(plugin);
        }
        if config.features.in_context_memory {
            context.register_plugin(in_context.clone());
        }
        if config.features.persistent_instructions {
            context.register_plugin(Arc::new(PersistentInstructionsPlugin::new()));
        }
        if config.features.user_info {
            context.register_plugin(Arc::new(UserInfoPlugin::new()));
        }
        if config.features.todo {
            context.register_plugin(Arc::new(TodoPlugin::new()));
        }
        context.set_tool_schemas(tools.wire_definitions());

        Self {
            provider: Box::new(provider),
            context,
            tools,
            hooks: HookRegistry::new(),
            session: Box::new(NoSessionManager),
            memory,
            in_context,
            events,
            cancel: CancellationToken::new(),
            config,
            destroyed: false,
        }
    }

    pub fn with_session(mut self, session: impl SessionManager + 'static) -> Self {
        self.session = Box::new(session);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.context.set_system_prompt(prompt);
        self
    }

    pub fn with_strategy(mut self, strategy: impl CompactionStrategy + 'static) -> Self {
        self.context.set_strategy(strategy);
        self
    }

    /// Register an extra tool and refresh the schemas the context sends.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool).expect("tool registration");
        self.context.set_tool_schemas(self.tools.wire_definitions());
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn memory(&self) -> &Arc<WorkingMemory> {
        &self.memory
    }

    pub fn in_context_memory(&self) -> &Arc<InContextMemoryPlugin> {
        &self.in_context
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Request cancellation. Checked before every provider call and every
    /// tool call; an in-flight tool is never interrupted.
    pub fn cancel(&self, reason: &str) {
        info!(reason, "agent cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Replace a fired cancellation token so the agent can run again. Used
    /// by the executor between retries and iterations.
    pub fn reset_cancellation(&mut self) {
        self.cancel = CancellationToken::new();
    }

    /// Adopt a caller-provided token, e.g. a child of a plan-level token so
    /// plan cancellation cascades into the running agent.
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Invoke a registered tool directly, outside the reasoning loop. The
    /// executor uses this for poll-style external waits.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        self.ensure_alive().map_err(|_| ToolError::Execution {
            tool: name.to_string(),
            message: "agent destroyed".into(),
        })?;
        self.tools.execute(name, args, &self.tool_context()).await
    }

    fn ensure_alive(&self) -> Result<(), AgentError> {
        if self.destroyed {
            Err(AgentError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            user_id: self.config.user_id.clone(),
            account_id: self.config.account_id.clone(),
            memory: self.memory.clone(),
        }
    }

    /// Run to completion: reasoning/tool cycles until the model answers
    /// without tool calls, an iteration limit fires, or a hook stops us.
    pub async fn run(&mut self, prompt: &str) -> Result<AgentResult, AgentError> {
        self.run_loop(prompt, None).await
    }

    /// Like `run`, emitting the stream protocol for each response.
    pub async fn run_streaming(
        &mut self,
        prompt: &str,
        tx: tokio::sync::mpsc::Sender<StreamEvent>,
    ) -> Result<AgentResult, AgentError> {
        self.run_loop(prompt, Some(tx)).await
    }

    async fn run_loop(
        &mut self,
        prompt: &str,
        stream: Option<tokio::sync::mpsc::Sender<StreamEvent>>,
    ) -> Result<AgentResult, AgentError> {
        self.ensure_alive()?;
        if let Directive::Cancel { reason } =
            self.hooks.dispatch(&Event::new(Point::BeforeExecution, 0))
        {
            warn!(reason, "cancelled by before:execution hook");
            return Err(AgentError::Cancelled);
        }

        let mut converter = StreamConverter::new();
        let mut pending = vec![Message::user(prompt)];
        let mut total_usage = Usage::default();
        let mut final_text = String::new();
        let mut output_items: Vec<MessagePart> = Vec::new();
        let mut iterations = 0;

        let outcome: Result<(), AgentError> = loop {
            if iterations >= self.config.max_iterations {
                warn!(max_iterations = self.config.max_iterations, "agent hit iteration limit");
                break Ok(());
            }
            if self.cancel.is_cancelled() {
                break Err(AgentError::Cancelled);
            }
            match self.hooks.dispatch(&Event::new(Point::PauseCheck, iterations)) {
                Directive::Cancel { reason } => {
                    info!(reason, iterations, "cancelled by pause:check hook");
                    self.cancel.cancel();
                    break Err(AgentError::Cancelled);
                }
                Directive::Pause { reason } => {
                    info!(reason, iterations, "paused by pause:check hook");
                    break Ok(());
                }
                _ => {}
            }

            self.events.publish(RuntimeEvent::IterationStart { iteration: iterations });

            let prepared = self.context.prepare(&pending)?;
            self.context.commit_input(std::mem::take(&mut pending));
            let mut request = prepared.request;
            request.temperature = self.config.temperature;

            self.hooks.dispatch(&Event::new(Point::BeforeLlm, iterations));
            let response = tokio::select! {
                result = self.provider.generate(request) => result?,
                _ = self.cancel.cancelled() => {
                    info!(iterations, "cancelled during inference");
                    break Err(AgentError::Cancelled);
                }
            };
            total_usage.accumulate(&response.usage);
            iterations += 1;

            let response_text = response.output_text();
            self.hooks
                .dispatch(&Event::new(Point::AfterLlm, iterations).with_response(&response_text));
            self.context.push_assistant(&response);
            output_items.extend(response.content.clone());
            if !response_text.is_empty() {
                final_text = response_text.clone();
                self.events.publish(RuntimeEvent::Text { content: response_text.clone() });
            }

            if let Some(ref tx) = stream {
                let _ = tx.send(converter.start()).await;
                if !response_text.is_empty() {
                    let _ = tx.send(converter.text_delta(&response_text)).await;
                }
                for (id, name, input) in response.tool_uses() {
                    let _ = tx.send(converter.tool_call_start(id, name)).await;
                    let _ = tx.send(converter.tool_call_delta(id, &input.to_string())).await;
                    if let Ok(done) = converter.tool_call_done(id) {
                        let _ = tx.send(done).await;
                    }
                }
                let _ = tx.send(converter.complete(response.stop_reason, response.usage)).await;
            }

            let tool_uses: Vec<(String, String, serde_json::Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if tool_uses.is_empty() {
                match response.stop_reason {
                    StopReason::MaxTokens => {
                        info!(iterations, "response truncated, continuing");
                        continue;
                    }
                    _ => break Ok(()),
                }
            }

            let mut results = Vec::new();
            for (id, name, input) in tool_uses {
                let (content, is_error) = if self.cancel.is_cancelled() {
                    ("cancelled before execution".to_string(), true)
                } else {
                    self.execute_tool_call(&name, input.clone(), iterations).await
                };
                self.events.publish(RuntimeEvent::ToolResult {
                    name: name.clone(),
                    output: content.clone(),
                    is_error,
                });
                results.push(MessagePart::ToolResult { id, name, content, error: is_error });
            }
            let cancelled = self.cancel.is_cancelled();
            pending = vec![Message::tool_results(results)];
            if cancelled {
                // Keep the pair intact in history, then stop.
                self.context.commit_input(std::mem::take(&mut pending));
                break Err(AgentError::Cancelled);
            }
        };

        self.hooks.dispatch(&Event::new(Point::AfterExecution, iterations));
        self.events.publish(RuntimeEvent::Finished { iterations });
        let consolidation = self.context.consolidate();
        if consolidation.performed {
            info!(tokens_changed = consolidation.tokens_changed, "post-cycle consolidation");
        }
        if self.config.session_id.is_some() {
            self.save_session().await?;
        }

        outcome.map(|()| AgentResult {
            output_text: final_text,
            output_items,
            usage: total_usage,
            iterations,
        })
    }

    /// One tool call: hooks, approval, execution, result shaping.
    async fn execute_tool_call(
        &mut self,
        name: &str,
        input: serde_json::Value,
        iteration: usize,
    ) -> (String, bool) {
        self.events.publish(RuntimeEvent::ToolCall { name: name.to_string(), input: input.clone() });

        let before = Event::new(Point::BeforeTool, iteration).with_tool(name, &input);
        if let Directive::Deny { reason } = self.hooks.dispatch(&before) {
            return (format!("tool call denied: {reason}"), true);
        }
        let approve = Event::new(Point::ApproveTool, iteration).with_tool(name, &input);
        if let Directive::Deny { reason } = self.hooks.dispatch(&approve) {
            return (format!("tool call denied: {reason}"), true);
        }

        let ctx = self.tool_context();
        let (content, is_error) = match self.tools.execute(name, input.clone(), &ctx).await {
            Ok(value) => (render_tool_output(&value), false),
            Err(e) => (e.to_string(), true),
        };
        let content = self.truncate_tool_result(content);

        self.hooks.dispatch(&Event::new(Point::AfterTool, iteration).with_tool(name, &input));
        (content, is_error)
    }

    /// A single tool result may not eat more than a quarter of the usable
    /// window.
    fn truncate_tool_result(&self, content: String) -> String {
        let limit_tokens =
            self.config.max_context_tokens.saturating_sub(self.config.response_reserve) / 4;
        let limit_chars = (limit_tokens as usize) * 4;
        if content.len() <= limit_chars {
            return content;
        }
        let keep = (0..=limit_chars).rev().find(|&i| content.is_char_boundary(i)).unwrap_or(0);
        let dropped = content.len() - keep;
        let mut truncated = content[..keep].to_string();
        truncated.push_str(&format!("\n…[output truncated, {dropped} bytes dropped]"));
        truncated
    }

    /// One-shot provider call outside the conversation. Used for
    /// reflection-style validation.
    pub async fn run_direct(
        &self,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, AgentError> {
        self.ensure_alive()?;
        let request = InferenceRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.response_reserve,
            temperature: Some(temperature),
            system: None,
            tools: Vec::new(),
            messages: vec![Message::user(prompt)],
        };
        let response = self.provider.generate(request).await?;
        Ok(response.output_text())
    }

    /// Persist the current session under `config.session_id`.
    pub async fn save_session(&self) -> Result<(), AgentError> {
        let Some(ref session_id) = self.config.session_id else {
            return Ok(());
        };
        let document = SessionDocument {
            version: 1,
            conversation: self.context.conversation().to_vec(),
            plugin_states: self.context.plugin_states(),
            system_prompt: self
                .context
                .snapshot()
                .get("system_prompt")
                .and_then(|v| v.as_str())
                .map(String::from),
            metadata: SessionMetadata {
                saved_at: chrono::Utc::now().timestamp_millis(),
                agent_id: self.config.agent_id.clone(),
                model: self.config.model.clone(),
            },
        };
        self.session.save(session_id, &document).await
    }

    /// Load a session document and adopt its conversation and plugin states.
    /// Returns false if no such session exists.
    pub async fn restore_session(&mut self, session_id: &str) -> Result<bool, AgentError> {
        self.ensure_alive()?;
        let Some(document) = self.session.load(session_id).await? else {
            return Ok(false);
        };
        if document.version != 1 {
            return Err(AgentError::Session(format!(
                "unsupported session version: {}",
                document.version
            )));
        }
        self.context.restore(&json!({
            "conversation": document.conversation,
            "system_prompt": document.system_prompt,
        }))?;
        self.context.restore_plugin_states(&document.plugin_states)?;
        self.config.session_id = Some(session_id.to_string());
        Ok(true)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Idempotent teardown: cancels outstanding work, ends the memory
    /// session, destroys the context and its plugins, drops subscribers.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.cancel.cancel();
        self.memory.session_end();
        self.context.destroy();
        self.hooks.clear();
        self.events.clear();
        self.destroyed = true;
    }
}

fn render_tool_output(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
