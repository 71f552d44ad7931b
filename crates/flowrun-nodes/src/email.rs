//! The `email` node
//!
//! Outbox-deferred: the DAG runner queues it transactionally and the outbox
//! worker invokes this executor. Subject and bodies are rendered with the
//! message template engine (simple `{{name}}` or the rich mode).

use std::sync::Arc;

use async_trait::async_trait;
use flowrun_core::template::render_message;
use flowrun_core::{
    EmailOptions, EmailSender, ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor,
};
use serde_json::{json, Value};
use tracing::debug;

pub struct EmailExecutor {
    sender: Arc<dyn EmailSender>,
}

impl EmailExecutor {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

fn address_list(value: Option<&Value>, scope: &Value) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(|addr| render_message(addr.trim(), scope))
            .filter(|addr| !addr.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|addr| render_message(addr, scope))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl NodeExecutor for EmailExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config = &ctx.node_config;
        let scope = &ctx.input;

        let to = address_list(config.get("to"), scope);
        if to.is_empty() {
            return Ok(ExecutionResult::fail("email node has no recipients"));
        }

        let options = EmailOptions {
            to,
            cc: address_list(config.get("cc"), scope),
            bcc: address_list(config.get("bcc"), scope),
            subject: config
                .get("subject")
                .and_then(Value::as_str)
                .map(|s| render_message(s, scope))
                .unwrap_or_default(),
            text: config
                .get("text")
                .and_then(Value::as_str)
                .map(|s| render_message(s, scope)),
            html: config
                .get("html")
                .and_then(Value::as_str)
                .map(|s| render_message(s, scope)),
            attachments: config
                .get("attachments")
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| ExecutorError::invalid_config(format!("invalid attachments: {e}")))?
                .unwrap_or_default(),
            template: config
                .get("template")
                .and_then(Value::as_str)
                .map(String::from),
            template_variables: config.get("template_variables").cloned(),
            idempotency_key: ctx.idempotency_key.clone(),
        };

        debug!(node_id = %ctx.node_id, to = ?options.to, "sending email");
        let result = self.sender.send(ctx.account_id, options).await?;

        if result.success {
            Ok(ExecutionResult::ok(json!({
                "data": { "message_id": result.message_id },
                "sent": true,
            })))
        } else {
            Ok(ExecutionResult::fail(
                result.error.unwrap_or_else(|| "email provider rejected the message".to_string()),
            ))
        }
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        match config.get("to") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(()),
            Some(Value::Array(items)) if !items.is_empty() => Ok(()),
            _ => Err("email node needs at least one recipient in `to`".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::{EmailSendResult, LogEmailSender};
    use std::sync::Mutex;
    use uuid::Uuid;

    // Minimal capturing sender for assertions
    #[derive(Default)]
    struct CapturingSender {
        sent: Mutex<Vec<EmailOptions>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl EmailSender for CapturingSender {
        async fn send(
            &self,
            _account_id: Uuid,
            options: EmailOptions,
        ) -> Result<EmailSendResult, ExecutorError> {
            self.sent.lock().unwrap().push(options);
            match &self.fail_with {
                Some(error) => Ok(EmailSendResult {
                    success: false,
                    message_id: None,
                    error: Some(error.clone()),
                }),
                None => Ok(EmailSendResult {
                    success: true,
                    message_id: Some("m-1".to_string()),
                    error: None,
                }),
            }
        }
    }

    fn ctx(config: Value, input: Value) -> ExecutionContext {
        ExecutionContext::new(Uuid::now_v7(), Uuid::now_v7(), "e-1", config, input, json!({}))
    }

    #[tokio::test]
    async fn test_renders_and_sends() {
        let sender = Arc::new(CapturingSender::default());
        let executor = EmailExecutor::new(sender.clone());

        let result = executor
            .execute(&ctx(
                json!({
                    "to": "{{user.email}}",
                    "subject": "Hello {{user.name}}",
                    "text": "Your total is {{total}}"
                }),
                json!({"user": {"email": "a@b.c", "name": "Ada"}, "total": 12}),
            ))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output["sent"], json!(true));
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].to, vec!["a@b.c"]);
        assert_eq!(sent[0].subject, "Hello Ada");
        assert_eq!(sent[0].text.as_deref(), Some("Your total is 12"));
    }

    #[tokio::test]
    async fn test_provider_rejection_is_business_failure() {
        let sender = Arc::new(CapturingSender {
            fail_with: Some("mailbox full".to_string()),
            ..Default::default()
        });
        let result = EmailExecutor::new(sender)
            .execute(&ctx(json!({"to": "a@b.c", "subject": "s"}), json!({})))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("mailbox full"));
    }

    #[tokio::test]
    async fn test_missing_recipients_fails() {
        let result = EmailExecutor::new(Arc::new(LogEmailSender))
            .execute(&ctx(json!({"subject": "s"}), json!({})))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_idempotency_key_forwarded() {
        let sender = Arc::new(CapturingSender::default());
        let executor = EmailExecutor::new(sender.clone());
        let ctx = ctx(json!({"to": "a@b.c"}), json!({})).with_idempotency_key("k-9");
        executor.execute(&ctx).await.unwrap();
        assert_eq!(
            sender.sent.lock().unwrap()[0].idempotency_key.as_deref(),
            Some("k-9")
        );
    }
}
