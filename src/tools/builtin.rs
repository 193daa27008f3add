use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::memory::{QueryFilter, Scope, SetOptions, Tier};

use super::handler::{OutputSize, Tool, ToolContext, ToolDefinition};

/// The four memory tools every agent with working memory gets. A failed
/// store (memory full, bad key) comes back as an error tool result so the
/// model can delete entries and retry.
pub fn memory_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(MemoryStoreTool),
        Arc::new(MemoryGetTool),
        Arc::new(MemoryDeleteTool),
        Arc::new(MemoryQueryTool),
    ]
}

fn require_str<'a>(args: &'a Value, field: &str, tool: &str) -> Result<&'a str, ToolError> {
    args[field].as_str().ok_or_else(|| ToolError::ArgumentSchema {
        tool: tool.to_string(),
        reason: format!("missing required field: {field}"),
    })
}

pub struct MemoryStoreTool;

#[async_trait]
impl Tool for MemoryStoreTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_store".into(),
            description: "Store a value in working memory under a dotted key. Use tier \
                          prefixes to signal importance: raw. for scratch data, summary. \
                          for condensed notes, findings. for conclusions worth keeping."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Dotted namespace key, e.g. findings.api"},
                    "value": {"description": "Any JSON value"},
                    "description": {"type": "string", "description": "One-line summary, max 150 chars"},
                    "scope": {"type": "string", "enum": ["session", "plan", "persistent"]},
                    "pinned": {"type": "boolean"}
                },
                "required": ["key", "value", "description"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let key = require_str(&args, "key", "memory_store")?;
        let description = require_str(&args, "description", "memory_store")?;
        let scope = match args["scope"].as_str() {
            Some("plan") => Some(Scope::Plan),
            Some("persistent") => Some(Scope::Persistent),
            _ => None,
        };
        let opts = SetOptions { scope, priority: None, pinned: args["pinned"].as_bool().unwrap_or(false) };

        ctx.memory
            .set(key, description, args["value"].clone(), opts)
            .map_err(|e| ToolError::Execution { tool: "memory_store".into(), message: e.to_string() })?;
        Ok(json!({"stored": key}))
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn expected_output(&self) -> OutputSize {
        OutputSize::Small
    }
}

pub struct MemoryGetTool;

#[async_trait]
impl Tool for MemoryGetTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_get".into(),
            description: "Fetch a value from working memory by key.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"key": {"type": "string"}},
                "required": ["key"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let key = require_str(&args, "key", "memory_get")?;
        Ok(ctx.memory.get(key).unwrap_or(Value::Null))
    }

    fn idempotent(&self) -> bool {
        true
    }
}

pub struct MemoryDeleteTool;

#[async_trait]
impl Tool for MemoryDeleteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_delete".into(),
            description: "Delete a working-memory entry to free space.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"key": {"type": "string"}},
                "required": ["key"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let key = require_str(&args, "key", "memory_delete")?;
        Ok(json!({"deleted": ctx.memory.delete(key)}))
    }

    fn expected_output(&self) -> OutputSize {
        OutputSize::Small
    }
}

pub struct MemoryQueryTool;

#[async_trait]
impl Tool for MemoryQueryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_query".into(),
            description: "List working-memory entries matching a key substring and/or tier. \
                          Returns keys, descriptions, and sizes — not the values."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Key substring to match"},
                    "tier": {"type": "string", "enum": ["raw", "summary", "findings"]}
                }
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let filter = QueryFilter {
            pattern: args["pattern"].as_str().map(String::from),
            tier: match args["tier"].as_str() {
                Some("raw") => Some(Tier::Raw),
                Some("summary") => Some(Tier::Summary),
                Some("findings") => Some(Tier::Findings),
                _ => None,
            },
            scope: None,
        };
        let hits: Vec<Value> = ctx
            .memory
            .query(&filter)
            .into_iter()
            .map(|e| {
                json!({
                    "key": e.key,
                    "description": e.description,
                    "size_bytes": e.size_bytes,
                    "pinned": e.pinned,
                })
            })
            .collect();
        Ok(Value::Array(hits))
    }

    fn idempotent(&self) -> bool {
        true
    }
}
