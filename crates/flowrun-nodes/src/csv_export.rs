//! The `json_to_csv` node
//!
//! Given an array of uniform objects, emits CSV with a header row derived
//! from the first element's keys.

use async_trait::async_trait;
use flowrun_core::value::to_display_string;
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct JsonToCsvExecutor;

fn resolve_rows(input: &Value) -> Option<&Vec<Value>> {
    if let Value::Array(items) = input {
        return Some(items);
    }
    for key in ["array", "data", "rows"] {
        if let Some(Value::Array(items)) = input.get(key) {
            return Some(items);
        }
    }
    None
}

#[async_trait]
impl NodeExecutor for JsonToCsvExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let Some(rows) = resolve_rows(&ctx.input) else {
            return Ok(ExecutionResult::fail("input is not an array of objects"));
        };
        if rows.is_empty() {
            return Ok(ExecutionResult::fail("array is empty"));
        }

        let Some(first) = rows[0].as_object() else {
            return Ok(ExecutionResult::fail("element at index 0 is not an object"));
        };
        let headers: Vec<String> = first.keys().cloned().collect();

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&headers)
            .map_err(|e| ExecutorError::internal(format!("csv write failed: {e}")))?;

        for (index, row) in rows.iter().enumerate() {
            let Some(object) = row.as_object() else {
                return Ok(ExecutionResult::fail(format!(
                    "element at index {index} is not an object"
                )));
            };
            let record: Vec<String> = headers
                .iter()
                .map(|header| {
                    object
                        .get(header)
                        .map(to_display_string)
                        .unwrap_or_default()
                })
                .collect();
            writer
                .write_record(&record)
                .map_err(|e| ExecutorError::internal(format!("csv write failed: {e}")))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| ExecutorError::internal(format!("csv flush failed: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ExecutorError::internal(format!("csv is not utf-8: {e}")))?;

        Ok(ExecutionResult::ok(json!({
            "data": text,
            "rows": rows.len(),
            "headers": headers,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn run(input: Value) -> ExecutionResult {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "csv-1",
            json!({}),
            input,
            json!({}),
        );
        tokio_test::block_on(JsonToCsvExecutor.execute(&ctx)).unwrap()
    }

    #[test]
    fn test_emits_header_and_rows() {
        let result = run(json!([
            {"age": 30, "name": "John"},
            {"age": 25, "name": "Jane"}
        ]));
        assert!(result.success);
        let text = result.output["data"].as_str().unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("age,name"));
        assert_eq!(lines.next(), Some("30,John"));
        assert_eq!(lines.next(), Some("25,Jane"));
        assert_eq!(result.output["rows"], json!(2));
    }

    #[test]
    fn test_accepts_wrapped_array() {
        let result = run(json!({"array": [{"v": 1}]}));
        assert!(result.success);
    }

    #[test]
    fn test_missing_field_is_empty_cell() {
        let result = run(json!([{"a": 1, "b": 2}, {"a": 3}]));
        assert!(result.success);
        let text = result.output["data"].as_str().unwrap();
        assert!(text.lines().nth(2).unwrap().starts_with("3,"));
    }

    #[test]
    fn test_rejects_non_array() {
        assert!(!run(json!({"k": 1})).success);
        assert!(!run(json!([])).success);
        assert!(!run(json!([1, 2])).success);
    }

    #[test]
    fn test_quotes_values_with_commas() {
        let result = run(json!([{"note": "a,b"}]));
        let text = result.output["data"].as_str().unwrap();
        assert!(text.contains("\"a,b\""));
    }
}
