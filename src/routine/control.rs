use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::WorkingMemory;

use super::condition::Condition;
use super::plan::{Plan, TaskSpec};

/// Where an iteration source comes from: a memory key, a prior task's
/// result, or a JSON path inside a memory value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueSource {
    Key { key: String },
    Task { task: String },
    Path { key: String, path: String },
}

impl ValueSource {
    pub fn resolve(&self, memory: &WorkingMemory, plan: &Plan) -> Option<Value> {
        match self {
            Self::Key { key } => memory.peek(key),
            Self::Task { task } => {
                let task = plan.task_by_name(task).or_else(|| plan.task(task))?;
                let output = &task.result.as_ref()?.output;
                Some(
                    serde_json::from_str(output)
                        .unwrap_or_else(|_| Value::String(output.clone())),
                )
            }
            Self::Path { key, path } => walk_path(&memory.peek(key)?, path),
        }
    }
}

/// Dotted path with numeric array indices: `items.2.name`.
fn walk_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match segment.parse::<usize>() {
            Ok(index) => current.get(index)?.clone(),
            Err(_) => current.get(segment)?.clone(),
        };
    }
    Some(current)
}

/// Iteration operators driven by sub-task sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFlow {
    /// Run the sub-tasks once per element of `source`; iteration outputs
    /// accumulate into an array at `result_key`.
    Map {
        source: ValueSource,
        tasks: Vec<TaskSpec>,
        result_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration_timeout_ms: Option<u64>,
    },
    /// Like map, threading `{{fold.accumulator}}` across iterations; the
    /// final accumulator lands at `result_key`.
    Fold {
        source: ValueSource,
        tasks: Vec<TaskSpec>,
        initial_value: Value,
        result_key: String,
    },
    /// Loop the sub-tasks until the condition holds, up to `max_iterations`;
    /// the iteration index is exposed under `iteration_key`.
    Until {
        tasks: Vec<TaskSpec>,
        condition: Condition,
        max_iterations: usize,
        iteration_key: String,
    },
}
