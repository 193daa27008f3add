use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One typed piece of message content. Tool calls and their results carry
/// ids so history surgery can keep each pair adjacent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        id: String,
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        error: bool,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// One entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::text(text)],
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self { role: Role::Assistant, parts, timestamp: Utc::now() }
    }

    /// Tool results ride in a single tool-role message per cycle.
    pub fn tool_results(parts: Vec<MessagePart>) -> Self {
        Self { role: Role::Tool, parts, timestamp: Utc::now() }
    }

    /// Concatenated text content, ignoring tool parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_use(&self) -> bool {
        self.parts.iter().any(MessagePart::is_tool_use)
    }

    pub fn has_tool_result(&self) -> bool {
        self.parts.iter().any(MessagePart::is_tool_result)
    }

    /// Ids of every tool_use part in this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids of every tool_result part in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolResult { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Fully-formed request — the provider just sends it.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub system: Option<String>,
    pub tools: Vec<Value>,
    pub messages: Vec<ConversationMessage>,
}

/// What came back from the LLM.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub stop_reason: StopReason,
    pub content: Vec<MessagePart>,
    pub usage: Usage,
}

impl InferenceResponse {
    /// Concatenated text of the response.
    pub fn output_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The tool_use parts of the response, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token usage for a single inference call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_part_serde_tags() {
        let part = MessagePart::ToolUse {
            id: "c1".into(),
            name: "echo".into(),
            input: json!({"x": 1}),
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool_use");
        let back: MessagePart = serde_json::from_value(v).unwrap();
        assert!(back.is_tool_use());
    }

    #[test]
    fn tool_result_error_flag_omitted_when_false() {
        let ok = MessagePart::ToolResult {
            id: "c1".into(),
            name: "echo".into(),
            content: "fine".into(),
            error: false,
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert!(v.get("error").is_none());
    }

    #[test]
    fn pair_ids_line_up() {
        let call = ConversationMessage::assistant(vec![MessagePart::ToolUse {
            id: "c1".into(),
            name: "echo".into(),
            input: json!({}),
        }]);
        let result = ConversationMessage::tool_results(vec![MessagePart::ToolResult {
            id: "c1".into(),
            name: "echo".into(),
            content: "done".into(),
            error: false,
        }]);
        assert_eq!(call.tool_use_ids(), result.tool_result_ids());
    }

    #[test]
    fn output_text_skips_tool_parts() {
        let resp = InferenceResponse {
            stop_reason: StopReason::ToolUse,
            content: vec![
                MessagePart::text("working"),
                MessagePart::ToolUse { id: "c1".into(), name: "echo".into(), input: json!({}) },
            ],
            usage: Usage::default(),
        };
        assert_eq!(resp.output_text(), "working");
        assert_eq!(resp.tool_uses().len(), 1);
    }
}
