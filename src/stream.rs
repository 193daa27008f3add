use std::collections::HashMap;

use serde_json::Value;

use crate::error::InferenceError;
use crate::types::{InferenceResponse, MessagePart, StopReason, Usage};

/// Typed stream protocol. Every event carries a strictly increasing
/// sequence number assigned by the converter.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    ResponseCreated { sequence: u64 },
    OutputTextDelta { sequence: u64, delta: String },
    ToolCallStart { sequence: u64, id: String, name: String },
    ToolCallArgumentsDelta { sequence: u64, id: String, delta: String },
    ToolCallArgumentsDone { sequence: u64, id: String, arguments: Value },
    ResponseComplete { sequence: u64, response: InferenceResponse },
}

impl StreamEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::ResponseCreated { sequence }
            | Self::OutputTextDelta { sequence, .. }
            | Self::ToolCallStart { sequence, .. }
            | Self::ToolCallArgumentsDelta { sequence, .. }
            | Self::ToolCallArgumentsDone { sequence, .. }
            | Self::ResponseComplete { sequence, .. } => *sequence,
        }
    }
}

#[derive(Default)]
struct ToolCallBuffer {
    name: String,
    args: String,
    done_args: Option<Value>,
}

/// Turns provider deltas into the ordered stream protocol. Buffers partial
/// tool-call arguments per call id until `tool_call_done`; accumulates text
/// so `complete` can assemble the full response. State is cleared at
/// `start` and on `clear`.
#[derive(Default)]
pub struct StreamConverter {
    sequence: u64,
    text: String,
    calls: HashMap<String, ToolCallBuffer>,
    call_order: Vec<String>,
}

impl StreamConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    /// Begin a new response. Clears all buffered state.
    pub fn start(&mut self) -> StreamEvent {
        self.clear();
        StreamEvent::ResponseCreated { sequence: self.next() }
    }

    pub fn text_delta(&mut self, delta: &str) -> StreamEvent {
        self.text.push_str(delta);
        StreamEvent::OutputTextDelta { sequence: self.next(), delta: delta.to_string() }
    }

    pub fn tool_call_start(&mut self, id: &str, name: &str) -> StreamEvent {
        self.calls.insert(
            id.to_string(),
            ToolCallBuffer { name: name.to_string(), args: String::new(), done_args: None },
        );
        self.call_order.push(id.to_string());
        StreamEvent::ToolCallStart {
            sequence: self.next(),
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    pub fn tool_call_delta(&mut self, id: &str, delta: &str) -> StreamEvent {
        if let Some(buffer) = self.calls.get_mut(id) {
            buffer.args.push_str(delta);
        }
        StreamEvent::ToolCallArgumentsDelta {
            sequence: self.next(),
            id: id.to_string(),
            delta: delta.to_string(),
        }
    }

    /// Finish a tool call: parse the buffered argument JSON. An empty
    /// buffer parses as `{}`.
    pub fn tool_call_done(&mut self, id: &str) -> Result<StreamEvent, InferenceError> {
        let buffer = self
            .calls
            .get_mut(id)
            .ok_or_else(|| InferenceError::Parse(format!("unknown tool call id: {id}")))?;
        let arguments: Value = if buffer.args.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&buffer.args)
                .map_err(|e| InferenceError::Parse(format!("tool call {id} arguments: {e}")))?
        };
        buffer.done_args = Some(arguments.clone());
        Ok(StreamEvent::ToolCallArgumentsDone {
            sequence: self.next(),
            id: id.to_string(),
            arguments,
        })
    }

    /// Close the response, assembling the buffered text and tool calls.
    pub fn complete(&mut self, stop_reason: StopReason, usage: Usage) -> StreamEvent {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(MessagePart::text(self.text.clone()));
        }
        for id in &self.call_order {
            if let Some(buffer) = self.calls.get(id) {
                content.push(MessagePart::ToolUse {
                    id: id.clone(),
                    name: buffer.name.clone(),
                    input: buffer.done_args.clone().unwrap_or(Value::Null),
                });
            }
        }
        StreamEvent::ResponseComplete {
            sequence: self.next(),
            response: InferenceResponse { stop_reason, content, usage },
        }
    }

    /// Reset buffers and the sequence counter.
    pub fn clear(&mut self) {
        self.sequence = 0;
        self.text.clear();
        self.calls.clear();
        self.call_order.clear();
    }
}
