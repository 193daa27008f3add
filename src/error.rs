/// Errors from the provider layer. `is_permanent` decides retry policy:
/// permanent errors surface immediately, everything else is fair game for
/// the executor's retry loop.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("prompt exceeds model context window: {0}")]
    ContextLength(String),
    #[error("unknown provider: {0}")]
    ProviderNotFound(String),
    #[error("model not supported: {0}")]
    ModelNotSupported(String),
    #[error("invalid provider config: {0}")]
    InvalidConfig(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl InferenceError {
    /// Permanent errors are never retried. HTTP 4xx short of 429 counts as
    /// permanent; 429 and 5xx are transient.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Auth(_)
            | Self::ContextLength(_)
            | Self::ProviderNotFound(_)
            | Self::ModelNotSupported(_)
            | Self::InvalidConfig(_) => true,
            Self::Api { status, .. } => *status >= 400 && *status < 429,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory full: {needed} bytes needed, {available} available after eviction")]
    Full { needed: usize, available: usize },
    #[error("value too large: {size} bytes exceeds capacity of {max}")]
    ValueTooLarge { size: usize, max: usize },
    #[error("invalid key {key:?}: {reason}")]
    KeyFormat { key: String, reason: &'static str },
    #[error("description is {len} chars, max is {max}")]
    DescriptionTooLong { len: usize, max: usize },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid tool name {0:?}: must match ^[a-z][a-z0-9_]*$")]
    InvalidName(String),
    #[error("duplicate tool: {0}")]
    Duplicate(String),
    #[error("invalid arguments for {tool}: {reason}")]
    ArgumentSchema { tool: String, reason: String },
    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("tool {tool} failed: {message}")]
    Execution { tool: String, message: String },
    #[error("tool call denied: {0}")]
    Denied(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
    #[error("task {task:?} depends on unknown task {missing:?}")]
    DependencyMissing { task: String, missing: String },
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("dynamic task updates are disabled for this plan")]
    DynamicTasksDisabled,
    #[error("task {0} is in progress and cannot be removed")]
    TaskInProgress(String),
    #[error("task {task} exceeded max attempts ({attempts})")]
    MaxAttemptsExceeded { task: String, attempts: u32 },
    #[error("task {task} timed out waiting for external event")]
    ExternalWaitTimeout { task: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("session error: {0}")]
    Session(String),
    #[error("context error: {0}")]
    Context(String),
    #[error("input of {tokens} tokens does not fit ({available} available)")]
    InputTooLarge { tokens: u32, available: u32 },
    #[error("agent cancelled")]
    Cancelled,
    #[error("agent already destroyed")]
    Destroyed,
}

impl AgentError {
    /// Whether the executor may retry the failed attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Inference(e) => !e.is_permanent(),
            Self::Cancelled | Self::Destroyed => false,
            Self::Tool(_) => true,
            _ => false,
        }
    }
}
