//! Static data nodes: `json` and `json-array`

use async_trait::async_trait;
use flowrun_core::value::merge_passthrough;
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{json, Map, Value};

/// Emits the static map from `config.data`, passing the input through.
#[derive(Debug, Default)]
pub struct JsonExecutor;

#[async_trait]
impl NodeExecutor for JsonExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let data = ctx
            .node_config
            .get("data")
            .cloned()
            .unwrap_or(Value::Object(Map::new()));

        let mut output = Map::new();
        output.insert("data".to_string(), data);
        merge_passthrough(&mut output, &ctx.input);
        Ok(ExecutionResult::ok(Value::Object(output)))
    }
}

/// Validates a JSON array of objects and emits `{ array, count, schema }`.
///
/// The array comes from `config.data` when present, otherwise from the input
/// (the input itself, or its `array`/`data` field).
#[derive(Debug, Default)]
pub struct JsonArrayExecutor;

impl JsonArrayExecutor {
    fn resolve_array(ctx: &ExecutionContext) -> Option<Vec<Value>> {
        if let Some(Value::Array(items)) = ctx.node_config.get("data") {
            return Some(items.clone());
        }
        if let Value::Array(items) = &ctx.input {
            return Some(items.clone());
        }
        for key in ["array", "data"] {
            if let Some(Value::Array(items)) = ctx.input.get(key) {
                return Some(items.clone());
            }
        }
        None
    }
}

#[async_trait]
impl NodeExecutor for JsonArrayExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let Some(items) = Self::resolve_array(ctx) else {
            return Ok(ExecutionResult::fail("input is not a JSON array"));
        };
        if items.is_empty() {
            return Ok(ExecutionResult::fail("array is empty"));
        }

        let mut schema: Vec<String> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let Some(object) = item.as_object() else {
                return Ok(ExecutionResult::fail(format!(
                    "element at index {index} is not an object"
                )));
            };
            let keys: Vec<String> = object.keys().cloned().collect();
            if index == 0 {
                schema = keys;
            } else if validate_schema(&ctx.node_config) && keys != schema {
                return Ok(ExecutionResult::fail(format!(
                    "element at index {index} has different properties than the first element"
                )));
            }
        }

        Ok(ExecutionResult::ok(json!({
            "array": items,
            "count": items.len(),
            "schema": schema,
        })))
    }
}

fn validate_schema(config: &Value) -> bool {
    config
        .get("validateSchema")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(config: Value, input: Value) -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "n-1",
            config,
            input,
            json!({"nodeOutputs": {}, "input": {}}),
        )
    }

    #[tokio::test]
    async fn test_json_emits_config_data_with_passthrough() {
        let result = JsonExecutor
            .execute(&ctx(
                json!({"data": {"message": "a"}}),
                json!({"upstream": 1}),
            ))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["data"], json!({"message": "a"}));
        assert_eq!(result.output["upstream"], json!(1));
    }

    #[tokio::test]
    async fn test_json_defaults_to_empty_map() {
        let result = JsonExecutor
            .execute(&ctx(json!({}), Value::Null))
            .await
            .unwrap();
        assert_eq!(result.output["data"], json!({}));
    }

    #[tokio::test]
    async fn test_json_array_valid() {
        let result = JsonArrayExecutor
            .execute(&ctx(
                json!({"data": [{"v": 1}, {"v": 2}]}),
                Value::Null,
            ))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["count"], json!(2));
        assert_eq!(result.output["schema"], json!(["v"]));
    }

    #[tokio::test]
    async fn test_json_array_from_input() {
        let result = JsonArrayExecutor
            .execute(&ctx(json!({}), json!([{"a": 1}])))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["count"], json!(1));
    }

    #[tokio::test]
    async fn test_json_array_empty_fails() {
        let result = JsonArrayExecutor
            .execute(&ctx(json!({"data": []}), Value::Null))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_json_array_non_object_element_fails() {
        let result = JsonArrayExecutor
            .execute(&ctx(json!({"data": [{"v": 1}, 7]}), Value::Null))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not an object"));
    }

    #[tokio::test]
    async fn test_json_array_mixed_schema_fails_when_validating() {
        let result = JsonArrayExecutor
            .execute(&ctx(
                json!({"data": [{"a": 1}, {"b": 2}], "validateSchema": true}),
                Value::Null,
            ))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("different properties"));
    }

    #[tokio::test]
    async fn test_json_array_mixed_schema_passes_without_validation() {
        let result = JsonArrayExecutor
            .execute(&ctx(json!({"data": [{"a": 1}, {"b": 2}]}), Value::Null))
            .await
            .unwrap();
        assert!(result.success);
    }
}
