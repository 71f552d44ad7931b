//! Loop kinds: `loop` and `loop-accumulator`
//!
//! The executor here only derives the iteration list; driving the body
//! subgraph, marking executed nodes, and accumulating results is the loop
//! driver's job inside the engine.

use async_trait::async_trait;
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{json, Value};

/// Derive the items to iterate from a loop node's input: the input itself
/// when it is an array, otherwise its `array`/`results`/`data` field.
pub fn iteration_items(input: &Value) -> Result<Vec<Value>, String> {
    if let Value::Array(items) = input {
        return Ok(items.clone());
    }
    for key in ["array", "results", "data", "items"] {
        if let Some(Value::Array(items)) = input.get(key) {
            return Ok(items.clone());
        }
    }
    Err("loop input is not an array".to_string())
}

/// Accumulation mode of the `loop-accumulator`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationMode {
    /// Push each iteration result
    Array,
    /// Keep only the final non-null result
    Last,
}

/// Per-iteration error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandling {
    /// Drop failed iterations and continue
    Skip,
    /// Abort the whole accumulator on the first failure
    Fail,
}

/// Parsed `loop` / `loop-accumulator` configuration
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Milliseconds between iterations (not after the last)
    pub iteration_delay_ms: u64,
    /// Output key for the accumulated value
    pub accumulator_variable: String,
    pub mode: AccumulationMode,
    pub error_handling: ErrorHandling,
}

impl LoopConfig {
    pub fn parse(config: &Value) -> Result<Self, String> {
        let iteration_delay_ms = config
            .get("iterationDelay")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let accumulator_variable = config
            .get("accumulatorVariable")
            .and_then(Value::as_str)
            .unwrap_or("accumulated")
            .to_string();
        let mode = match config.get("mode").and_then(Value::as_str) {
            Some("last") => AccumulationMode::Last,
            Some("array") | None => AccumulationMode::Array,
            Some(other) => return Err(format!("invalid accumulation mode: {other:?}")),
        };
        let error_handling = match config.get("errorHandling").and_then(Value::as_str) {
            Some("skip") => ErrorHandling::Skip,
            Some("fail") | None => ErrorHandling::Fail,
            Some(other) => return Err(format!("invalid errorHandling: {other:?}")),
        };
        Ok(Self {
            iteration_delay_ms,
            accumulator_variable,
            mode,
            error_handling,
        })
    }

    /// The empty accumulator of the declared mode
    pub fn empty_accumulator(&self) -> Value {
        match self.mode {
            AccumulationMode::Array => Value::Array(Vec::new()),
            AccumulationMode::Last => Value::Null,
        }
    }
}

/// Executor for both loop kinds: emits the iteration list. The driver calls
/// this, then walks the body subgraph once per element.
#[derive(Debug, Default)]
pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let items = match iteration_items(&ctx.input) {
            Ok(items) => items,
            Err(message) => return Ok(ExecutionResult::fail(message)),
        };
        let results: Vec<Value> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| json!({ "index": index, "item": item }))
            .collect();
        Ok(ExecutionResult::ok(json!({
            "results": results,
            "count": results.len(),
        })))
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        LoopConfig::parse(config).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_iteration_list() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "loop-1",
            json!({}),
            json!({"array": [{"v": 1}, {"v": 2}]}),
            json!({}),
        );
        let result = LoopExecutor.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["count"], json!(2));
        assert_eq!(result.output["results"][0], json!({"index": 0, "item": {"v": 1}}));
        assert_eq!(result.output["results"][1]["index"], json!(1));
    }

    #[tokio::test]
    async fn test_non_array_input_fails() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "loop-1",
            json!({}),
            json!({"v": 1}),
            json!({}),
        );
        let result = LoopExecutor.execute(&ctx).await.unwrap();
        assert!(!result.success);
    }

    #[test]
    fn test_config_defaults() {
        let config = LoopConfig::parse(&json!({})).unwrap();
        assert_eq!(config.iteration_delay_ms, 0);
        assert_eq!(config.accumulator_variable, "accumulated");
        assert_eq!(config.mode, AccumulationMode::Array);
        assert_eq!(config.error_handling, ErrorHandling::Fail);
        assert_eq!(config.empty_accumulator(), json!([]));
    }

    #[test]
    fn test_config_parse() {
        let config = LoopConfig::parse(&json!({
            "iterationDelay": 250,
            "accumulatorVariable": "collected",
            "mode": "last",
            "errorHandling": "skip"
        }))
        .unwrap();
        assert_eq!(config.iteration_delay_ms, 250);
        assert_eq!(config.accumulator_variable, "collected");
        assert_eq!(config.mode, AccumulationMode::Last);
        assert_eq!(config.error_handling, ErrorHandling::Skip);
        assert_eq!(config.empty_accumulator(), Value::Null);

        assert!(LoopConfig::parse(&json!({"mode": "sum"})).is_err());
    }
}
