use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::InferenceError;
use crate::provider::InferenceProvider;
use crate::types::{
    ConversationMessage, InferenceRequest, InferenceResponse, MessagePart, Role, StopReason, Usage,
};

/// Claude API client via Anthropic's messages endpoint.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_client(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn wire_message(msg: &ConversationMessage) -> Value {
        let role = match msg.role {
            Role::Assistant => "assistant",
            // Tool results ride in a user-role message on the wire.
            _ => "user",
        };
        let content: Vec<Value> = msg
            .parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => json!({"type": "text", "text": text}),
                MessagePart::ToolUse { id, name, input } => {
                    json!({"type": "tool_use", "id": id, "name": name, "input": input})
                }
                MessagePart::ToolResult { id, content, error, .. } => {
                    let mut block = json!({
                        "type": "tool_result",
                        "tool_use_id": id,
                        "content": content,
                    });
                    if *error {
                        block["is_error"] = json!(true);
                    }
                    block
                }
            })
            .collect();
        json!({"role": role, "content": content})
    }

    /// `{type:"function", function:{…}}` definitions become Anthropic's
    /// `{name, description, input_schema}` shape.
    fn wire_tool(def: &Value) -> Value {
        let function = &def["function"];
        if function.is_object() {
            json!({
                "name": function["name"],
                "description": function["description"],
                "input_schema": function["parameters"],
            })
        } else {
            def.clone()
        }
    }

    fn classify_status(status: u16, body: String) -> InferenceError {
        match status {
            401 | 403 => InferenceError::Auth(body),
            404 => InferenceError::ModelNotSupported(body),
            400 if body.contains("context") || body.contains("too long") => {
                InferenceError::ContextLength(body)
            }
            400 => InferenceError::InvalidConfig(body),
            408 => InferenceError::Timeout(body),
            429 => InferenceError::RateLimited(body),
            _ => InferenceError::Api { status, body },
        }
    }
}

#[async_trait]
impl InferenceProvider for AnthropicProvider {
    async fn generate(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let messages: Vec<Value> = request.messages.iter().map(Self::wire_message).collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if let Some(ref system) = request.system {
            body["system"] = Value::String(system.clone());
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(Self::wire_tool).collect());
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(e.to_string())
                } else {
                    InferenceError::Network(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        if status != 200 {
            return Err(Self::classify_status(status, text));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;

        let stop_reason = match parsed["stop_reason"].as_str().unwrap_or("unknown") {
            "end_turn" | "stop_sequence" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            other => {
                return Err(InferenceError::Parse(format!("unknown stop_reason: {other}")))
            }
        };

        let raw = parsed["content"].as_array().cloned().unwrap_or_default();
        let content = raw
            .iter()
            .filter_map(|block| match block["type"].as_str()? {
                "text" => Some(MessagePart::Text {
                    text: block["text"].as_str().unwrap_or("").to_string(),
                }),
                "tool_use" => Some(MessagePart::ToolUse {
                    id: block["id"].as_str()?.to_string(),
                    name: block["name"].as_str()?.to_string(),
                    input: block["input"].clone(),
                }),
                _ => None,
            })
            .collect();

        let usage = Usage {
            input_tokens: parsed["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(InferenceResponse { stop_reason, content, usage })
    }
}
