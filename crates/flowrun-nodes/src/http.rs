//! The `http` node: templated HTTP requests
//!
//! URL, headers, and body are templated against the node input via
//! `{{path.to.field}}`; URL substitutions are additionally query-encoded.
//! Success iff the status is in [200, 300); non-2xx responses are business
//! failures, transport errors are engine errors.

use std::time::Duration;

use async_trait::async_trait;
use flowrun_core::template::{render_simple, render_simple_url};
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

/// Build the shared HTTP client with bounded pools.
///
/// 10 idle connections per host, 90 s idle timeout, 10 s connect timeout,
/// 30 s request timeout.
pub fn shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Render every string leaf of a JSON body against the scope.
fn render_body(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render_simple(s, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_body(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_body(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config = &ctx.node_config;
        let url_template = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::invalid_config("http node is missing url"))?;
        let url = render_simple_url(url_template, &ctx.input);

        let method_text = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method: Method = method_text
            .to_uppercase()
            .parse()
            .map_err(|_| ExecutorError::invalid_config(format!("invalid method: {method_text:?}")))?;

        let mut request = self.client.request(method, &url);

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(text) = value.as_str() {
                    request = request.header(name.as_str(), render_simple(text, &ctx.input));
                }
            }
        }

        if let Some(body) = config.get("body") {
            request = match body {
                Value::String(text) => request.body(render_simple(text, &ctx.input)),
                // JSON bodies auto-set the content type
                other => request.json(&render_body(other, &ctx.input)),
            };
        }

        debug!(node_id = %ctx.node_id, %url, "sending http request");
        let response = tokio::select! {
            result = request.send() => {
                result.map_err(|e| ExecutorError::Http(e.to_string()))?
            }
            _ = ctx.cancelled() => return Err(ExecutorError::Cancelled(ctx.execution_id)),
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutorError::Http(e.to_string()))?;
        // Parse as JSON if possible, otherwise keep the raw string
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            Ok(ExecutionResult::ok(json!({
                "data": body,
                "status": status.as_u16(),
            })))
        } else {
            Ok(ExecutionResult::fail(format!(
                "HTTP {}: {}",
                status.as_u16(),
                flowrun_core::value::to_display_string(&body)
            )))
        }
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        if config.get("url").and_then(Value::as_str).is_none() {
            return Err("http node is missing url".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_body_templates_string_leaves() {
        let scope = json!({"user": {"id": 7, "name": "Ada"}});
        let body = json!({
            "id": "{{user.id}}",
            "nested": {"greeting": "hi {{user.name}}"},
            "list": ["{{user.id}}", 3],
            "count": 3
        });
        let rendered = render_body(&body, &scope);
        assert_eq!(rendered["id"], json!("7"));
        assert_eq!(rendered["nested"]["greeting"], json!("hi Ada"));
        assert_eq!(rendered["list"][0], json!("7"));
        assert_eq!(rendered["count"], json!(3));
    }

    #[test]
    fn test_validate_config_requires_url() {
        let executor = HttpExecutor::new(shared_client());
        assert!(executor.validate_config(&json!({})).is_err());
        assert!(executor
            .validate_config(&json!({"url": "https://example.com"}))
            .is_ok());
    }
}
