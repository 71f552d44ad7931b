//! The `conditional` node: boolean expression evaluation

use async_trait::async_trait;
use flowrun_core::expression::{self, ConditionSpec, LogicalOp};
use flowrun_core::value::merge_passthrough;
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{Map, Value};
use tracing::debug;

/// Evaluates either a literal `expression` string or the structured
/// `{ conditions, logicalOperator }` form, compiled to an expression.
///
/// The boolean result is echoed on both `data` and `result` for backwards
/// compatibility.
#[derive(Debug, Default)]
pub struct ConditionalExecutor;

fn resolve_expression(config: &Value) -> Result<String, String> {
    if let Some(expression) = config.get("expression").and_then(Value::as_str) {
        return Ok(expression.to_string());
    }
    if let Some(conditions_value) = config.get("conditions") {
        let conditions: Vec<ConditionSpec> = serde_json::from_value(conditions_value.clone())
            .map_err(|e| format!("invalid conditions: {e}"))?;
        let logical = match config.get("logicalOperator").and_then(Value::as_str) {
            Some("OR") => LogicalOp::Or,
            Some("AND") | None => LogicalOp::And,
            Some(other) => return Err(format!("invalid logicalOperator: {other:?}")),
        };
        return Ok(expression::compile(&conditions, logical));
    }
    Err("conditional config needs an expression or conditions".to_string())
}

#[async_trait]
impl NodeExecutor for ConditionalExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let expression_text = match resolve_expression(&ctx.node_config) {
            Ok(e) => e,
            Err(message) => return Ok(ExecutionResult::fail(message)),
        };

        let outcome = match expression::evaluate(&expression_text, &ctx.input) {
            Ok(v) => v,
            Err(err) => return Ok(ExecutionResult::fail(err.to_string())),
        };
        debug!(node_id = %ctx.node_id, expression = %expression_text, outcome, "condition evaluated");

        let mut output = Map::new();
        output.insert("data".to_string(), Value::Bool(outcome));
        output.insert("result".to_string(), Value::Bool(outcome));
        merge_passthrough(&mut output, &ctx.input);
        Ok(ExecutionResult::ok(Value::Object(output)))
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        resolve_expression(config).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn run(config: Value, input: Value) -> ExecutionResult {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "c-1",
            config,
            input,
            json!({"nodeOutputs": {}, "input": {}}),
        );
        tokio_test::block_on(ConditionalExecutor.execute(&ctx)).unwrap()
    }

    #[test]
    fn test_literal_expression() {
        let result = run(
            json!({"expression": "data.age >= 18"}),
            json!({"data": {"age": 21}}),
        );
        assert!(result.success);
        assert_eq!(result.output["data"], json!(true));
        assert_eq!(result.output["result"], json!(true));
    }

    #[test]
    fn test_structured_conditions_and() {
        let result = run(
            json!({
                "conditions": [
                    {"left": "age", "operator": "gte", "right": 18},
                    {"left": "status", "operator": "eq", "right": "active"}
                ],
                "logicalOperator": "AND"
            }),
            json!({"age": 30, "status": "active"}),
        );
        assert!(result.success);
        assert_eq!(result.output["result"], json!(true));
    }

    #[test]
    fn test_structured_conditions_or() {
        let result = run(
            json!({
                "conditions": [
                    {"left": "age", "operator": "gt", "right": 100},
                    {"left": "vip", "operator": "eq", "right": true}
                ],
                "logicalOperator": "OR"
            }),
            json!({"age": 30, "vip": true}),
        );
        assert_eq!(result.output["result"], json!(true));
    }

    #[test]
    fn test_false_outcome_passes_input_through() {
        let result = run(
            json!({"expression": "count > 5"}),
            json!({"count": 2, "name": "x"}),
        );
        assert!(result.success);
        assert_eq!(result.output["result"], json!(false));
        assert_eq!(result.output["name"], json!("x"));
    }

    #[test]
    fn test_missing_config_fails() {
        let result = run(json!({}), json!({}));
        assert!(!result.success);
    }

    #[test]
    fn test_unparseable_expression_fails() {
        let result = run(json!({"expression": "a >"}), json!({"a": 1}));
        assert!(!result.success);
    }
}
