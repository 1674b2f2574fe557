//! Schema compiler: turns a manifest `ParameterSchema` into a runtime
//! [`Validator`], plus shared value checks used by handlers.
//!
//! Validation happens before any handler runs, so a rejected call never
//! reaches the engine channel.

use serde_json::{Map, Value};

use super::manifest::{FieldSchema, ParameterSchema};
use crate::error::BridgeError;

/// Compiled form of a single field schema.
#[derive(Debug, Clone, PartialEq)]
enum FieldCheck {
    String,
    Number,
    Integer,
    Boolean,
    Array(Option<Box<CompiledField>>),
    Object,
    /// Unrecognized type tag: accept anything.
    PassThrough,
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledField {
    check: FieldCheck,
    allowed: Option<Vec<Value>>,
}

/// Accepts or rejects a raw argument object, returning the coerced arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Validator {
    fields: Vec<(String, CompiledField)>,
    required: Vec<String>,
}

/// Every problem found in one argument object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid arguments: {}", self.issues.join("; "))
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for BridgeError {
    fn from(e: ValidationError) -> Self {
        BridgeError::validation(e.to_string())
    }
}

/// Compile a parameter schema into a validator. Never fails: unknown type
/// tags degrade to pass-through so newer manifests work with older clients.
pub fn compile(schema: &ParameterSchema) -> Validator {
    Validator {
        fields: schema
            .properties
            .iter()
            .map(|(name, field)| (name.clone(), compile_field(name, field)))
            .collect(),
        required: schema.required.clone(),
    }
}

fn compile_field(name: &str, field: &FieldSchema) -> CompiledField {
    let check = match field.type_tag.as_deref() {
        Some("string") => FieldCheck::String,
        Some("number") => FieldCheck::Number,
        Some("integer") => FieldCheck::Integer,
        Some("boolean") => FieldCheck::Boolean,
        Some("array") => FieldCheck::Array(
            field
                .items
                .as_deref()
                .map(|items| Box::new(compile_field(name, items))),
        ),
        Some("object") => FieldCheck::Object,
        None => FieldCheck::PassThrough,
        Some(other) => {
            tracing::debug!(field = name, type_tag = other, "unknown type tag, accepting any value");
            FieldCheck::PassThrough
        }
    };
    CompiledField {
        check,
        allowed: field.allowed.clone(),
    }
}

impl Validator {
    pub fn validate(&self, args: &Value) -> Result<Value, ValidationError> {
        let input = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(ValidationError {
                    issues: vec![format!("arguments must be an object, got {}", kind_of(other))],
                })
            }
        };

        let mut issues = Vec::new();
        let mut output = Map::with_capacity(input.len());

        for name in &self.required {
            if !matches!(input.get(name), Some(v) if !v.is_null()) {
                issues.push(format!("missing required field '{name}'"));
            }
        }

        for (name, value) in input {
            if value.is_null() {
                // Absent-tolerant: explicit null on an optional field means "not given".
                continue;
            }
            match self.fields.iter().find(|(n, _)| *n == name) {
                Some((_, field)) => match field.coerce(&name, value) {
                    Ok(v) => {
                        output.insert(name, v);
                    }
                    Err(msg) => issues.push(msg),
                },
                None => {
                    output.insert(name, value);
                }
            }
        }

        if issues.is_empty() {
            Ok(Value::Object(output))
        } else {
            Err(ValidationError { issues })
        }
    }
}

impl CompiledField {
    fn coerce(&self, path: &str, value: Value) -> Result<Value, String> {
        let coerced = match &self.check {
            FieldCheck::PassThrough => value,
            FieldCheck::Object => {
                if value.is_object() {
                    value
                } else {
                    return Err(format!("'{path}' must be an object, got {}", kind_of(&value)));
                }
            }
            FieldCheck::String => match value {
                Value::String(_) => value,
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                other => return Err(format!("'{path}' must be a string, got {}", kind_of(&other))),
            },
            FieldCheck::Number => match value {
                Value::Number(_) => value,
                Value::String(ref s) => match s.trim().parse::<f64>() {
                    Ok(f) if f.is_finite() => serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| format!("'{path}' must be a finite number"))?,
                    _ => return Err(format!("'{path}' must be a number, got \"{s}\"")),
                },
                other => return Err(format!("'{path}' must be a number, got {}", kind_of(&other))),
            },
            FieldCheck::Integer => coerce_integer(path, value)?,
            FieldCheck::Boolean => match value {
                Value::Bool(_) => value,
                Value::String(ref s) if s == "true" => Value::Bool(true),
                Value::String(ref s) if s == "false" => Value::Bool(false),
                other => return Err(format!("'{path}' must be a boolean, got {}", kind_of(&other))),
            },
            FieldCheck::Array(items) => match value {
                Value::Array(elems) => {
                    let Some(items) = items else {
                        return self.check_allowed(path, Value::Array(elems));
                    };
                    let mut out = Vec::with_capacity(elems.len());
                    for (i, elem) in elems.into_iter().enumerate() {
                        out.push(items.coerce(&format!("{path}[{i}]"), elem)?);
                    }
                    Value::Array(out)
                }
                other => return Err(format!("'{path}' must be an array, got {}", kind_of(&other))),
            },
        };
        self.check_allowed(path, coerced)
    }

    fn check_allowed(&self, path: &str, value: Value) -> Result<Value, String> {
        match &self.allowed {
            Some(allowed) if !allowed.contains(&value) => {
                let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
                Err(format!(
                    "'{path}' must be one of [{}], got {value}",
                    options.join(", ")
                ))
            }
            _ => Ok(value),
        }
    }
}

fn coerce_integer(path: &str, value: Value) -> Result<Value, String> {
    let as_float = match &value {
        Value::Number(n) if n.is_i64() || n.is_u64() => return Ok(value),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            if let Ok(i) = s.trim().parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.trim().parse::<f64>().ok()
        }
        other => return Err(format!("'{path}' must be an integer, got {}", kind_of(other))),
    };
    match as_float {
        #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            Ok(Value::from(f as i64))
        }
        _ => Err(format!("'{path}' must be an integer, got {value}")),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── Shared handler checks ───────────────────────────────────────

/// Validate a 3-component vector of finite numbers.
pub fn validate_vec3(values: &[f64], name: &str) -> Result<[f64; 3], BridgeError> {
    let [x, y, z] = values else {
        return Err(BridgeError::validation(format!(
            "{name} must have exactly 3 components, got {}",
            values.len()
        )));
    };
    if ![x, y, z].iter().all(|v| v.is_finite()) {
        return Err(BridgeError::validation(format!("{name} components must be finite")));
    }
    Ok([*x, *y, *z])
}

/// Validate a display name: non-empty after trimming.
pub fn validate_name(name: &str) -> Result<String, BridgeError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::validation("Name must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::manifest::Manifest;

    fn schema(json: Value) -> ParameterSchema {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let m = Manifest::builtin().unwrap();
        let v = compile(&m.get("rename_entity").unwrap().parameters);
        let err = v.validate(&json!({ "entityId": "e1" })).unwrap_err();
        assert_eq!(err.issues, vec!["missing required field 'name'"]);
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let v = compile(&schema(json!({
            "properties": { "a": { "type": "string" } },
            "required": ["a"]
        })));
        assert!(v.validate(&json!({ "a": null })).is_err());
    }

    #[test]
    fn optional_fields_tolerate_absence_and_null() {
        let v = compile(&schema(json!({
            "properties": { "a": { "type": "string" }, "b": { "type": "integer" } },
            "required": ["a"]
        })));
        assert_eq!(v.validate(&json!({ "a": "x" })).unwrap(), json!({ "a": "x" }));
        assert_eq!(v.validate(&json!({ "a": "x", "b": null })).unwrap(), json!({ "a": "x" }));
    }

    #[test]
    fn null_args_behave_like_empty_object() {
        let v = compile(&ParameterSchema::default());
        assert_eq!(v.validate(&Value::Null).unwrap(), json!({}));
        assert!(v.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn primitives_are_coerced() {
        let v = compile(&schema(json!({
            "properties": {
                "n": { "type": "number" },
                "i": { "type": "integer" },
                "b": { "type": "boolean" },
                "s": { "type": "string" }
            },
            "required": []
        })));
        let out = v
            .validate(&json!({ "n": "2.5", "i": 4.0, "b": "true", "s": 7 }))
            .unwrap();
        assert_eq!(out, json!({ "n": 2.5, "i": 4, "b": true, "s": "7" }));
    }

    #[test]
    fn fractional_integer_is_rejected() {
        let v = compile(&schema(json!({
            "properties": { "i": { "type": "integer" } },
            "required": []
        })));
        assert!(v.validate(&json!({ "i": 1.5 })).is_err());
        assert!(v.validate(&json!({ "i": "abc" })).is_err());
        assert_eq!(v.validate(&json!({ "i": "12" })).unwrap(), json!({ "i": 12 }));
    }

    #[test]
    fn enum_mismatch_is_an_error_not_a_coercion() {
        let m = Manifest::builtin().unwrap();
        let v = compile(&m.get("set_gizmo_mode").unwrap().parameters);
        assert!(v.validate(&json!({ "mode": "rotate" })).is_ok());
        let err = v.validate(&json!({ "mode": "Rotate" })).unwrap_err();
        assert!(err.issues[0].contains("must be one of"));
    }

    #[test]
    fn array_items_are_checked() {
        let m = Manifest::builtin().unwrap();
        let v = compile(&m.get("set_transform").unwrap().parameters);
        let out = v
            .validate(&json!({ "entityId": "e1", "position": [1, "2", 3.5] }))
            .unwrap();
        assert_eq!(out["position"], json!([1, 2.0, 3.5]));
        let err = v
            .validate(&json!({ "entityId": "e1", "position": [1, "up", 3] }))
            .unwrap_err();
        assert!(err.issues[0].contains("position[1]"));
    }

    #[test]
    fn unknown_type_tag_passes_anything_through() {
        let v = compile(&schema(json!({
            "properties": { "v": { "type": "vector3" } },
            "required": ["v"]
        })));
        let out = v.validate(&json!({ "v": { "x": 1 } })).unwrap();
        assert_eq!(out, json!({ "v": { "x": 1 } }));
        assert!(v.validate(&json!({})).is_err());
    }

    #[test]
    fn all_issues_are_reported() {
        let v = compile(&schema(json!({
            "properties": { "a": { "type": "boolean" }, "b": { "type": "string" } },
            "required": ["b"]
        })));
        let err = v.validate(&json!({ "a": "maybe" })).unwrap_err();
        assert_eq!(err.issues.len(), 2);
    }

    #[test]
    fn vec3_helper() {
        assert_eq!(validate_vec3(&[1.0, 2.0, 3.0], "position").unwrap(), [1.0, 2.0, 3.0]);
        assert!(validate_vec3(&[1.0, 2.0], "position").is_err());
        assert!(validate_vec3(&[1.0, f64::NAN, 3.0], "position").is_err());
    }
}
