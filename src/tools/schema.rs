use serde_json::Value;

/// Lightweight structural validation of tool arguments against a JSON
/// Schema: the input must be an object when the schema says so, required
/// fields must be present, and declared property types must match. Catches
/// the model's obvious argument mistakes before execution without a full
/// schema-validation dependency.
pub fn validate_args(input: &Value, schema: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if schema_obj.get("type").and_then(Value::as_str) == Some("object") && !input.is_object() {
        return Err(format!("expected object arguments, got {}", type_name(input)));
    }

    let Some(input_obj) = input.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !input_obj.contains_key(field) {
                return Err(format!("missing required field: {field}"));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        for (field, prop_schema) in properties {
            let (Some(value), Some(expected)) =
                (input_obj.get(field), prop_schema.get("type").and_then(Value::as_str))
            else {
                continue;
            };
            if !type_matches(value, expected) {
                return Err(format!(
                    "field '{field}' expected type '{expected}', got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
