use serde_json::Value;

use crate::types::{ConversationMessage, MessagePart};

/// Verdict returned by the reflection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub is_complete: bool,
    pub completion_score: u32,
    pub explanation: String,
}

impl ValidationOutcome {
    /// An unparseable reply counts as a failed validation, not an error.
    pub fn parse_failure() -> Self {
        Self {
            is_complete: false,
            completion_score: 0,
            explanation: "validator reply was not valid JSON".into(),
        }
    }
}

/// One CALL/RESULT pair for the validator's tool log.
#[derive(Debug, Clone)]
pub struct ToolLogEntry {
    pub name: String,
    pub arguments: String,
    pub result: String,
}

const ARGS_TRUNCATE_AT: usize = 500;

/// Walk the conversation and pair every tool_use with its result.
pub fn collect_tool_log(conversation: &[ConversationMessage]) -> Vec<ToolLogEntry> {
    let mut entries = Vec::new();
    let mut pending: Vec<(String, String, String)> = Vec::new(); // id, name, args

    for msg in conversation {
        for part in &msg.parts {
            match part {
                MessagePart::ToolUse { id, name, input } => {
                    let mut args = input.to_string();
                    if args.len() > ARGS_TRUNCATE_AT {
                        let cut = (0..=ARGS_TRUNCATE_AT)
                            .rev()
                            .find(|&i| args.is_char_boundary(i))
                            .unwrap_or(0);
                        args.truncate(cut);
                        args.push('…');
                    }
                    pending.push((id.clone(), name.clone(), args));
                }
                MessagePart::ToolResult { id, content, error, .. } => {
                    if let Some(pos) = pending.iter().position(|(pid, _, _)| pid == id) {
                        let (_, name, arguments) = pending.remove(pos);
                        let result = if *error {
                            format!("ERROR: {content}")
                        } else {
                            content.clone()
                        };
                        entries.push(ToolLogEntry { name, arguments, result });
                    }
                }
                MessagePart::Text { .. } => {}
            }
        }
    }
    entries
}

/// Build the reflection prompt: criteria, the response under review, memory
/// snapshots, and the tool-call log.
pub fn build_validation_prompt(
    criteria: &[String],
    response_text: &str,
    in_context_snapshot: &Value,
    memory_index: &str,
    tool_log: &[ToolLogEntry],
) -> String {
    let mut prompt = String::from(
        "You are validating whether a task was completed. Judge the response \
         against every criterion and reply with ONLY a JSON object:\n\
         {\"isComplete\": bool, \"completionScore\": 0-100, \"explanation\": \"...\"}\n\n\
         Completion criteria:\n",
    );
    for criterion in criteria {
        prompt.push_str(&format!("- {criterion}\n"));
    }
    prompt.push_str("\nResponse under review:\n");
    prompt.push_str(response_text);
    prompt.push_str("\n\nIn-context memory:\n");
    prompt.push_str(&in_context_snapshot.to_string());
    prompt.push_str("\n\nWorking memory index:\n");
    prompt.push_str(memory_index);
    if !tool_log.is_empty() {
        prompt.push_str("\n\nTool calls made:\n");
        for entry in tool_log {
            prompt.push_str(&format!("CALL {}({})\n", entry.name, entry.arguments));
            prompt.push_str(&format!("RESULT {}\n", entry.result));
        }
    }
    prompt
}

/// Pull the verdict out of the validator's reply. Tolerates prose around
/// the JSON object and both camelCase and snake_case keys.
pub fn parse_validation_reply(text: &str) -> ValidationOutcome {
    let Some(start) = text.find('{') else {
        return ValidationOutcome::parse_failure();
    };
    let Some(end) = text.rfind('}') else {
        return ValidationOutcome::parse_failure();
    };
    let Ok(parsed) = serde_json::from_str::<Value>(&text[start..=end]) else {
        return ValidationOutcome::parse_failure();
    };

    let is_complete = parsed
        .get("isComplete")
        .or_else(|| parsed.get("is_complete"))
        .and_then(Value::as_bool);
    let completion_score = parsed
        .get("completionScore")
        .or_else(|| parsed.get("completion_score"))
        .and_then(Value::as_u64);
    let (Some(is_complete), Some(completion_score)) = (is_complete, completion_score) else {
        return ValidationOutcome::parse_failure();
    };

    ValidationOutcome {
        is_complete,
        completion_score: completion_score.min(100) as u32,
        explanation: parsed
            .get("explanation")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}
