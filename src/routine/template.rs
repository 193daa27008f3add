use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder regex"));

/// Values available to `{{…}}` placeholders: `param.X` from plan inputs,
/// `map.item` / `map.index` / `map.total`, `fold.accumulator`, and any
/// iteration key an `until` loop exposes.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: HashMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: &serde_json::Map<String, Value>) -> Self {
        let mut bindings = Self::new();
        for (key, value) in params {
            bindings.set(format!("param.{key}"), value.clone());
        }
        bindings
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Replace every known `{{placeholder}}`. Unknown placeholders are left
    /// untouched so a typo stays visible in the prompt.
    pub fn resolve(&self, text: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(text, |caps: &regex::Captures<'_>| {
                match self.values.get(&caps[1]) {
                    Some(value) => render(value),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
