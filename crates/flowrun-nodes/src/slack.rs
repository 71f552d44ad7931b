//! The `slack` node
//!
//! Outbox-deferred. Posts a rendered message to the configured incoming
//! webhook URL.

use async_trait::async_trait;
use flowrun_core::template::render_message;
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{json, Map, Value};
use tracing::debug;

pub struct SlackExecutor {
    client: reqwest::Client,
}

impl SlackExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeExecutor for SlackExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config = &ctx.node_config;
        let webhook_url = config
            .get("webhook_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::invalid_config("slack node is missing webhook_url"))?;

        let message_template = config
            .get("message")
            .or_else(|| config.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let text = render_message(message_template, &ctx.input);
        if text.is_empty() {
            return Ok(ExecutionResult::fail("slack message rendered empty"));
        }

        let mut payload = Map::new();
        payload.insert("text".to_string(), Value::String(text));
        if let Some(channel) = config.get("channel").and_then(Value::as_str) {
            payload.insert("channel".to_string(), Value::String(channel.to_string()));
        }

        debug!(node_id = %ctx.node_id, "posting slack message");
        let response = tokio::select! {
            result = self.client.post(webhook_url).json(&payload).send() => {
                result.map_err(|e| ExecutorError::Http(e.to_string()))?
            }
            _ = ctx.cancelled() => return Err(ExecutorError::Cancelled(ctx.execution_id)),
        };

        let status = response.status();
        if status.is_success() {
            Ok(ExecutionResult::ok(json!({ "data": true, "sent": true })))
        } else {
            let body = response.text().await.unwrap_or_default();
            Ok(ExecutionResult::fail(format!(
                "slack webhook returned {}: {body}",
                status.as_u16()
            )))
        }
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        if config.get("webhook_url").and_then(Value::as_str).is_none() {
            return Err("slack node is missing webhook_url".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::shared_client;

    #[test]
    fn test_validate_config() {
        let executor = SlackExecutor::new(shared_client());
        assert!(executor.validate_config(&json!({})).is_err());
        assert!(executor
            .validate_config(&json!({"webhook_url": "https://hooks.slack.example/x"}))
            .is_ok());
    }
}
