//! Output-schema validation
//!
//! A compact JSON-Schema checker covering the subset cascade configs use:
//! `type`, `properties`, `required`, `items`, `enum`, numeric and length
//! bounds, `pattern`. Phase outputs that are strings get one parse attempt
//! as JSON before validation so models may answer with a fenced or bare
//! JSON document.

use serde_json::Value;

/// Validate a value against a schema. Returns every violation found.
pub fn validate(value: &Value, schema: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    check(value, schema, "$", &mut errors);
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate a phase output: strings are first parsed as JSON (with a fenced
/// code block tolerated) so `"{\"a\": 1}"` can satisfy an object schema.
/// When the parsed form fails but the raw string satisfies the schema (e.g.
/// output `"42"` against a string schema), the raw string wins.
pub fn validate_output(output: &Value, schema: &Value) -> Result<Value, Vec<String>> {
    if let Value::String(s) = output {
        if let Some(parsed) = parse_embedded_json(s) {
            match validate(&parsed, schema) {
                Ok(()) => return Ok(parsed),
                Err(parsed_errors) => {
                    return validate(output, schema)
                        .map(|_| output.clone())
                        .map_err(|_| parsed_errors);
                }
            }
        }
    }
    validate(output, schema).map(|_| output.clone())
}

/// Extract a JSON document from a string, unwrapping one code fence if
/// present.
pub fn parse_embedded_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    // ```json ... ``` fences
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))?
        .trim_start_matches(['\r', '\n'])
        .strip_suffix("```")?
        .trim();
    serde_json::from_str(unfenced).ok()
}

fn check(value: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let schema_obj = match schema.as_object() {
        Some(obj) => obj,
        // A non-object schema constrains nothing
        None => return,
    };

    if let Some(type_spec) = schema_obj.get("type") {
        let allowed: Vec<&str> = match type_spec {
            Value::String(s) => vec![s.as_str()],
            Value::Array(types) => types.iter().filter_map(|t| t.as_str()).collect(),
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(value, t)) {
            errors.push(format!(
                "{path}: expected type {}, got {}",
                allowed.join("|"),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            errors.push(format!("{path}: value not in enum"));
        }
    }

    match value {
        Value::Object(map) => {
            if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
                for name in required.iter().filter_map(|r| r.as_str()) {
                    if !map.contains_key(name) {
                        errors.push(format!("{path}: missing required property '{name}'"));
                    }
                }
            }
            if let Some(properties) = schema_obj.get("properties").and_then(|p| p.as_object()) {
                for (name, property_schema) in properties {
                    if let Some(property_value) = map.get(name) {
                        check(property_value, property_schema, &format!("{path}.{name}"), errors);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema_obj.get("items") {
                for (index, item) in items.iter().enumerate() {
                    check(item, item_schema, &format!("{path}[{index}]"), errors);
                }
            }
            if let Some(min) = schema_obj.get("minItems").and_then(|v| v.as_u64()) {
                if (items.len() as u64) < min {
                    errors.push(format!("{path}: fewer than {min} items"));
                }
            }
            if let Some(max) = schema_obj.get("maxItems").and_then(|v| v.as_u64()) {
                if (items.len() as u64) > max {
                    errors.push(format!("{path}: more than {max} items"));
                }
            }
        }
        Value::String(s) => {
            if let Some(min) = schema_obj.get("minLength").and_then(|v| v.as_u64()) {
                if (s.chars().count() as u64) < min {
                    errors.push(format!("{path}: shorter than minLength {min}"));
                }
            }
            if let Some(max) = schema_obj.get("maxLength").and_then(|v| v.as_u64()) {
                if (s.chars().count() as u64) > max {
                    errors.push(format!("{path}: longer than maxLength {max}"));
                }
            }
            if let Some(pattern) = schema_obj.get("pattern").and_then(|v| v.as_str()) {
                match regex::Regex::new(pattern) {
                    Ok(re) if !re.is_match(s) => {
                        errors.push(format!("{path}: does not match pattern {pattern}"));
                    }
                    Err(_) => errors.push(format!("{path}: invalid pattern in schema: {pattern}")),
                    _ => {}
                }
            }
        }
        Value::Number(n) => {
            let as_f64 = n.as_f64().unwrap_or(0.0);
            if let Some(min) = schema_obj.get("minimum").and_then(|v| v.as_f64()) {
                if as_f64 < min {
                    errors.push(format!("{path}: below minimum {min}"));
                }
            }
            if let Some(max) = schema_obj.get("maximum").and_then(|v| v.as_f64()) {
                if as_f64 > max {
                    errors.push(format!("{path}: above maximum {max}"));
                }
            }
        }
        _ => {}
    }
}

fn type_matches(value: &Value, type_name: &str) -> bool {
    match type_name {
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
