use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::ToolError;

use super::handler::{Tool, ToolContext, ToolDefinition};
use super::schema::validate_args;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("name regex"));

/// Catalog of available tools: definitions for the LLM, execution with
/// argument validation and an optional per-call timeout.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    /// 0 disables the timeout.
    timeout_ms: u64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new(), timeout_ms: 0 }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Register a tool. Names must match `^[a-z][a-z0-9_]*$` and be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.definition().name;
        if !NAME_RE.is_match(&name) {
            return Err(ToolError::InvalidName(name));
        }
        if self.tools.iter().any(|t| t.definition().name == name) {
            return Err(ToolError::Duplicate(name));
        }
        self.tools.push(tool);
        Ok(())
    }

    /// Builder-style registration for wiring up an agent. Panics on invalid
    /// or duplicate names — a construction-time programmer error.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool).expect("tool registration failed");
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.definition().name == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Wire-shape definitions for the provider request.
    pub fn wire_definitions(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.definition().wire()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition().name).collect()
    }

    /// Execute a tool: schema-validate the arguments, then run under the
    /// configured timeout.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        let definition = tool.definition();

        validate_args(&args, &definition.parameters).map_err(|reason| {
            ToolError::ArgumentSchema { tool: name.to_string(), reason }
        })?;

        debug!(tool = name, "executing tool");
        if self.timeout_ms == 0 {
            return tool.execute(args, ctx).await;
        }

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), tool.execute(args, ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout { tool: name.to_string(), timeout_ms: self.timeout_ms }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::WorkingMemory;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Echoes its arguments".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"]
                }),
            }
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "slow".into(),
                description: "Sleeps".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    struct BadName;

    #[async_trait]
    impl Tool for BadName {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "Bad-Name".into(),
                description: String::new(),
                parameters: Value::Null,
            }
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(Arc::new(WorkingMemory::default()))
    }

    #[tokio::test]
    async fn execute_validates_and_runs() {
        let reg = ToolRegistry::new().with_tool(Arc::new(EchoTool));
        let out = reg.execute("echo", json!({"msg": "hi"}), &ctx()).await.unwrap();
        assert_eq!(out, json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn bad_arguments_rejected_before_execution() {
        let reg = ToolRegistry::new().with_tool(Arc::new(EchoTool));
        let err = reg.execute("echo", json!({"msg": 7}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::ArgumentSchema { .. }));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let reg = ToolRegistry::new();
        let err = reg.execute("nope", json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Unknown(_)));
    }

    #[test]
    fn name_rules_enforced() {
        let mut reg = ToolRegistry::new();
        assert!(matches!(reg.register(Arc::new(BadName)), Err(ToolError::InvalidName(_))));
        reg.register(Arc::new(EchoTool)).unwrap();
        assert!(matches!(reg.register(Arc::new(EchoTool)), Err(ToolError::Duplicate(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires() {
        let reg = ToolRegistry::new().with_timeout_ms(50).with_tool(Arc::new(SlowTool));
        let err = reg.execute("slow", json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 50, .. }));
    }

    #[test]
    fn wire_shape() {
        let reg = ToolRegistry::new().with_tool(Arc::new(EchoTool));
        let wire = &reg.wire_definitions()[0];
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "echo");
        assert!(wire["function"]["parameters"].is_object());
    }
}
