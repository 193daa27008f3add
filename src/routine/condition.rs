use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::WorkingMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Exists,
    NotExists,
    Equals,
    Contains,
    Truthy,
    GreaterThan,
    LessThan,
}

/// What to do with the task when its condition is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFalse {
    #[default]
    Skip,
    Fail,
    /// Stay pending until memory changes.
    Wait,
}

/// A gate evaluated against working memory before a task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub key: String,
    pub op: ConditionOp,
    /// Comparison operand for equals / contains / greater_than / less_than.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub on_false: OnFalse,
}

impl Condition {
    pub fn new(key: impl Into<String>, op: ConditionOp) -> Self {
        Self { key: key.into(), op, value: None, on_false: OnFalse::default() }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn on_false(mut self, on_false: OnFalse) -> Self {
        self.on_false = on_false;
        self
    }

    /// Evaluate without touching access stats.
    pub fn evaluate(&self, memory: &WorkingMemory) -> bool {
        let current = memory.peek(&self.key);
        match self.op {
            ConditionOp::Exists => current.is_some(),
            ConditionOp::NotExists => current.is_none(),
            ConditionOp::Equals => match (&current, &self.value) {
                (Some(v), Some(expected)) => v == expected,
                _ => false,
            },
            ConditionOp::Contains => match (&current, &self.value) {
                (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle),
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                _ => false,
            },
            ConditionOp::Truthy => current.as_ref().map(is_truthy).unwrap_or(false),
            ConditionOp::GreaterThan => compare(&current, &self.value, |a, b| a > b),
            ConditionOp::LessThan => compare(&current, &self.value, |a, b| a < b),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(current: &Option<Value>, operand: &Option<Value>, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (current.as_ref().and_then(Value::as_f64), operand.as_ref().and_then(Value::as_f64)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}
