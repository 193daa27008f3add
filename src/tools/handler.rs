use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::memory::WorkingMemory;

/// The tool definition sent to the LLM.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Wire shape: `{type:"function", function:{name, description, parameters}}`.
    pub fn wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Hint about how big a tool's output tends to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSize {
    Small,
    #[default]
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionScope {
    Once,
    #[default]
    Session,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct Permission {
    pub scope: PermissionScope,
    pub risk: RiskLevel,
    pub approval_message: Option<String>,
}

/// Ambient state handed to every tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub user_id: Option<String>,
    pub account_id: Option<String>,
    pub memory: Arc<WorkingMemory>,
}

impl ToolContext {
    pub fn new(memory: Arc<WorkingMemory>) -> Self {
        Self { user_id: None, account_id: None, memory }
    }
}

/// One callable tool. Consumers implement this per tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;

    /// Safe to re-run with the same arguments.
    fn idempotent(&self) -> bool {
        false
    }

    fn expected_output(&self) -> OutputSize {
        OutputSize::default()
    }

    fn permission(&self) -> Permission {
        Permission::default()
    }

    /// Short human-readable rendering of a call, for logs and approvals.
    fn describe_call(&self, args: &Value) -> String {
        format!("{}({args})", self.definition().name)
    }
}
