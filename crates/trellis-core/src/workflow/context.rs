//! Workflow context helpers: dotted-path lookup, criterion keys, input
//! template resolution, schema validation and size-limited merging.
//!
//! The context itself is the insertion-ordered `ContextMap` stored on
//! `WorkflowState`; these functions are the only code that reads or writes
//! it on the engine's behalf.

use serde_json::{Value, json};
use thiserror::Error;
use trellis_types::workflow::{ContextMap, ContextSchema, WorkflowState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single context value written by a step (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total serialized size of the context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejections of a step's partial context. Both make the attempt a
/// step-execution failure.
#[derive(Debug, Error, PartialEq)]
pub enum ContextError {
    #[error("context schema violation: {0}")]
    Schema(String),

    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Path lookup
// ---------------------------------------------------------------------------

/// Look up a dotted path (e.g. `analysis.scores.0`) in the context.
///
/// Numeric segments index into arrays. Returns `None` for missing keys.
pub fn lookup_path<'a>(context: &'a ContextMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Convert a context value into a criterion key.
///
/// Strings are used as-is, booleans and numbers are stringified; `null`,
/// objects and arrays have no key.
pub fn criterion_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Template resolution
// ---------------------------------------------------------------------------

fn resolve_reference(expr: &str, state: &WorkflowState) -> Option<Value> {
    if let Some(path) = expr.strip_prefix("context.") {
        return lookup_path(&state.context, path).cloned();
    }
    match expr {
        "workflow.id" => Some(Value::String(state.workflow_id.to_string())),
        "workflow.definition" => Some(Value::String(state.definition_id.clone())),
        "workflow.node" => Some(Value::String(state.current_node.clone())),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve placeholders in a single string.
///
/// A string that is exactly one placeholder is replaced by the referenced
/// value itself (keeping its JSON type); otherwise each placeholder is
/// interpolated as text. Unknown references are left as-is.
fn resolve_string(template: &str, state: &WorkflowState) -> Value {
    let trimmed = template.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") {
            if let Some(value) = resolve_reference(inner.trim(), state) {
                return value;
            }
        }
    }

    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;
        result.push_str(&rest[..start]);
        let expr = rest[start + 2..end - 2].trim();
        match resolve_reference(expr, state) {
            Some(value) => result.push_str(&value_to_string(&value)),
            None => result.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }
    result.push_str(rest);
    Value::String(result)
}

/// Resolve a step's input template against the workflow state.
///
/// Supports `{{ context.<path> }}`, `{{ workflow.id }}`,
/// `{{ workflow.definition }}` and `{{ workflow.node }}` in every string
/// leaf of the template. A `null` template resolves to an empty object.
pub fn resolve_input(template: &Value, state: &WorkflowState) -> Value {
    match template {
        Value::Null => json!({}),
        Value::String(s) => resolve_string(s, state),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_leaf(v, state)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_leaf(v, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_leaf(value: &Value, state: &WorkflowState) -> Value {
    match value {
        Value::Null => Value::Null,
        other => resolve_input(other, state),
    }
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

fn check_fields(schema: &ContextSchema, values: &ContextMap) -> Result<(), String> {
    for (key, value) in values {
        match schema.fields.get(key) {
            Some(field) if !field.kind.matches(value) => {
                return Err(format!(
                    "field '{key}' expected {:?}, got {value}",
                    field.kind
                ));
            }
            None if !schema.allow_unknown => {
                return Err(format!("unknown field '{key}'"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate an initial context: required fields present, declared kinds
/// respected, no undeclared keys unless `allow_unknown`.
pub fn validate_initial_context(
    schema: Option<&ContextSchema>,
    context: &ContextMap,
) -> Result<(), String> {
    let Some(schema) = schema else {
        return Ok(());
    };
    for (key, field) in &schema.fields {
        if field.required && !context.contains_key(key) {
            return Err(format!("required field '{key}' is missing"));
        }
    }
    check_fields(schema, context)
}

/// Validate a step's partial context before it is merged.
pub fn validate_updates(
    schema: Option<&ContextSchema>,
    updates: &ContextMap,
) -> Result<(), ContextError> {
    match schema {
        Some(schema) => check_fields(schema, updates).map_err(ContextError::Schema),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Total serialized size of the context in bytes.
pub fn context_size(context: &ContextMap) -> usize {
    context
        .values()
        .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
        .sum()
}

/// Merge a step's partial context into `context` (last writer wins).
///
/// Values larger than `MAX_STEP_OUTPUT_SIZE` are replaced by a truncation
/// marker. The merge is applied to a copy and only committed when the result
/// stays under `MAX_CONTEXT_SIZE`.
pub fn merge_updates(context: &mut ContextMap, updates: ContextMap) -> Result<(), ContextError> {
    let mut merged = context.clone();
    for (key, value) in updates {
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                key = %key,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "context value exceeds size limit, truncating"
            );
            merged.insert(
                key,
                json!({
                    "_truncated": true,
                    "_original_size": size,
                    "_message": format!(
                        "value exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"
                    )
                }),
            );
        } else {
            merged.insert(key, value);
        }
    }

    let total = context_size(&merged);
    if total > MAX_CONTEXT_SIZE {
        return Err(ContextError::TooLarge {
            size: total,
            max: MAX_CONTEXT_SIZE,
        });
    }
    *context = merged;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
