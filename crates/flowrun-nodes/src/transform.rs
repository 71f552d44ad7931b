//! The `transform` node: an ordered pipeline of data operations
//!
//! Operation types: `extract` (JSONPath selection), `map` (field renames with
//! nested paths), `parse`/`stringify` (JSON string round-trip), `concat`
//! (join named fields). The first failing operation aborts the pipeline with
//! a business failure.

use async_trait::async_trait;
use flowrun_core::value::{get_path, remove_path, set_path, to_display_string};
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{json, Map, Value};
use serde_json_path::JsonPath;

#[derive(Debug, Default)]
pub struct TransformExecutor;

#[async_trait]
impl NodeExecutor for TransformExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let operations = match ctx.node_config.get("operations") {
            Some(Value::Array(ops)) => ops.clone(),
            Some(_) => {
                return Ok(ExecutionResult::fail("transform operations must be an array"))
            }
            None => Vec::new(),
        };

        let mut current = ctx.input.clone();
        for (index, operation) in operations.iter().enumerate() {
            let op_type = operation.get("type").and_then(Value::as_str).unwrap_or("");
            let config = operation.get("config").cloned().unwrap_or(json!({}));

            let applied = match op_type {
                "extract" => apply_extract(&current, &config),
                "map" => apply_map(&current, &config),
                "parse" => apply_parse(&current, &config),
                "stringify" => apply_stringify(&current, &config),
                "concat" => apply_concat(&current, &config),
                other => Err(format!("unknown transform operation type: {other:?}")),
            };

            match applied {
                Ok(next) => current = next,
                Err(message) => {
                    return Ok(ExecutionResult::fail(format!(
                        "operation {index} ({op_type}) failed: {message}"
                    )));
                }
            }
        }

        Ok(ExecutionResult::ok(json!({ "data": current })))
    }
}

/// Select a JSONPath. One match yields the value; several yield an array.
fn apply_extract(current: &Value, config: &Value) -> Result<Value, String> {
    let path = config
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing path".to_string())?;
    let parsed = JsonPath::parse(path).map_err(|e| format!("invalid JSONPath {path:?}: {e}"))?;
    let nodes = parsed.query(current).all();
    match nodes.as_slice() {
        [] => Err(format!("no match for path {path:?}")),
        [single] => Ok((*single).clone()),
        many => Ok(Value::Array(many.iter().map(|v| (*v).clone()).collect())),
    }
}

/// Rewrite field names. `mappings` entries carry `source`, `target`, and an
/// optional `removeSource`; `includeUnmapped` keeps the untouched fields.
fn apply_map(current: &Value, config: &Value) -> Result<Value, String> {
    let mappings = config
        .get("mappings")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing mappings".to_string())?;
    let include_unmapped = config
        .get("includeUnmapped")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut result = if include_unmapped {
        current.clone()
    } else {
        Value::Object(Map::new())
    };

    for (index, mapping) in mappings.iter().enumerate() {
        let source = mapping
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("mapping {index} is missing source"))?;
        let target = mapping
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("mapping {index} is missing target"))?;
        let remove_source = mapping
            .get("removeSource")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let value = get_path(current, source)
            .cloned()
            .ok_or_else(|| format!("source field {source:?} not found"))?;
        set_path(&mut result, target, value);

        if include_unmapped && remove_source {
            remove_path(&mut result, source);
        }
    }
    Ok(result)
}

/// Parse a JSON string into a value.
fn apply_parse(current: &Value, config: &Value) -> Result<Value, String> {
    let source_value = resolve_source(current, config)?;
    let text = source_value
        .as_str()
        .ok_or_else(|| "source is not a string".to_string())?;
    let parsed: Value =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    place_result(current, config, parsed)
}

/// Serialize a value into a JSON string.
fn apply_stringify(current: &Value, config: &Value) -> Result<Value, String> {
    let source_value = resolve_source(current, config)?;
    let text =
        serde_json::to_string(&source_value).map_err(|e| format!("stringify failed: {e}"))?;
    place_result(current, config, Value::String(text))
}

/// Join named fields with a separator into a target field.
fn apply_concat(current: &Value, config: &Value) -> Result<Value, String> {
    let fields = config
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing fields".to_string())?;
    let separator = config
        .get("separator")
        .and_then(Value::as_str)
        .unwrap_or("");
    let target = config
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or("concatenated");

    let mut parts = Vec::with_capacity(fields.len());
    for field in fields {
        let name = field
            .as_str()
            .ok_or_else(|| "field names must be strings".to_string())?;
        let value = get_path(current, name)
            .ok_or_else(|| format!("field {name:?} not found"))?;
        parts.push(to_display_string(value));
    }

    let mut result = current.clone();
    set_path(&mut result, target, Value::String(parts.join(separator)));
    Ok(result)
}

fn resolve_source(current: &Value, config: &Value) -> Result<Value, String> {
    match config.get("source").and_then(Value::as_str) {
        Some(path) => get_path(current, path)
            .cloned()
            .ok_or_else(|| format!("source field {path:?} not found")),
        None => Ok(current.clone()),
    }
}

fn place_result(current: &Value, config: &Value, value: Value) -> Result<Value, String> {
    match config.get("target").and_then(Value::as_str) {
        Some(path) => {
            let mut result = current.clone();
            set_path(&mut result, path, value);
            Ok(result)
        }
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn run(config: Value, input: Value) -> ExecutionResult {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "t-1",
            config,
            input,
            json!({"nodeOutputs": {}, "input": {}}),
        );
        tokio_test::block_on(TransformExecutor.execute(&ctx)).unwrap()
    }

    #[test]
    fn test_map_renames_fields() {
        let result = run(
            json!({"operations": [{
                "type": "map",
                "config": {"mappings": [
                    {"source": "firstName", "target": "first_name"},
                    {"source": "lastName", "target": "last_name"}
                ]}
            }]}),
            json!({"firstName": "John", "lastName": "Doe", "age": 30}),
        );
        assert!(result.success);
        assert_eq!(
            result.output["data"],
            json!({"first_name": "John", "last_name": "Doe"})
        );
    }

    #[test]
    fn test_map_include_unmapped_and_remove_source() {
        let result = run(
            json!({"operations": [{
                "type": "map",
                "config": {
                    "includeUnmapped": true,
                    "mappings": [
                        {"source": "a", "target": "renamed", "removeSource": true}
                    ]
                }
            }]}),
            json!({"a": 1, "b": 2}),
        );
        assert!(result.success);
        assert_eq!(result.output["data"], json!({"renamed": 1, "b": 2}));
    }

    #[test]
    fn test_map_nested_paths() {
        let result = run(
            json!({"operations": [{
                "type": "map",
                "config": {"mappings": [
                    {"source": "user.profile.name", "target": "contact.display_name"}
                ]}
            }]}),
            json!({"user": {"profile": {"name": "Ada"}}}),
        );
        assert!(result.success);
        assert_eq!(
            result.output["data"],
            json!({"contact": {"display_name": "Ada"}})
        );
    }

    #[test]
    fn test_extract_jsonpath() {
        let result = run(
            json!({"operations": [{
                "type": "extract",
                "config": {"path": "$.items[0].name"}
            }]}),
            json!({"items": [{"name": "first"}, {"name": "second"}]}),
        );
        assert!(result.success);
        assert_eq!(result.output["data"], json!("first"));
    }

    #[test]
    fn test_extract_multiple_matches_yield_array() {
        let result = run(
            json!({"operations": [{
                "type": "extract",
                "config": {"path": "$.items[*].name"}
            }]}),
            json!({"items": [{"name": "a"}, {"name": "b"}]}),
        );
        assert!(result.success);
        assert_eq!(result.output["data"], json!(["a", "b"]));
    }

    #[test]
    fn test_extract_no_match_fails() {
        let result = run(
            json!({"operations": [{
                "type": "extract",
                "config": {"path": "$.missing.field"}
            }]}),
            json!({"items": []}),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no match"));
    }

    #[test]
    fn test_parse_stringify_round_trip() {
        let result = run(
            json!({"operations": [
                {"type": "stringify", "config": {"source": "payload", "target": "raw"}},
                {"type": "parse", "config": {"source": "raw", "target": "decoded"}}
            ]}),
            json!({"payload": {"k": [1, 2]}}),
        );
        assert!(result.success);
        assert_eq!(result.output["data"]["decoded"], json!({"k": [1, 2]}));
    }

    #[test]
    fn test_parse_invalid_json_fails() {
        let result = run(
            json!({"operations": [{"type": "parse", "config": {"source": "raw"}}]}),
            json!({"raw": "{not json"}),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid JSON"));
    }

    #[test]
    fn test_concat() {
        let result = run(
            json!({"operations": [{
                "type": "concat",
                "config": {"fields": ["first", "last"], "separator": " ", "target": "full"}
            }]}),
            json!({"first": "John", "last": "Doe"}),
        );
        assert!(result.success);
        assert_eq!(result.output["data"]["full"], json!("John Doe"));
    }

    #[test]
    fn test_error_aborts_pipeline() {
        let result = run(
            json!({"operations": [
                {"type": "extract", "config": {"path": "$.nope"}},
                {"type": "concat", "config": {"fields": ["a"]}}
            ]}),
            json!({"a": 1}),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("operation 0"));
    }

    #[test]
    fn test_unknown_operation_fails() {
        let result = run(
            json!({"operations": [{"type": "rotate", "config": {}}]}),
            json!({}),
        );
        assert!(!result.success);
    }

    #[test]
    fn test_empty_pipeline_passes_input_through() {
        let result = run(json!({}), json!({"a": 1}));
        assert!(result.success);
        assert_eq!(result.output["data"], json!({"a": 1}));
    }
}
