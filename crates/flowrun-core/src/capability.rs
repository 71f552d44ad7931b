//! Consumed collaborator capabilities
//!
//! The engine does not own email provider plumbing; it consumes an
//! [`EmailSender`] capability injected at composition time. The outbox worker
//! calls it when draining `email.send` messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ExecutorError;

/// Options for one outbound email
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailOptions {
    #[serde(default)]
    pub to: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,

    #[serde(default)]
    pub subject: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<EmailAttachment>,

    /// Provider-side template id, when the provider renders the body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_variables: Option<serde_json::Value>,

    /// Deduplication key for providers that support it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// One attachment, content base64-encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

/// Provider response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSendResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Email delivery capability
///
/// `Ok` with `success = false` is a provider rejection (business failure);
/// `Err` is a transport or configuration failure (engine error).
#[async_trait]
pub trait EmailSender: Send + Sync + 'static {
    async fn send(
        &self,
        account_id: Uuid,
        options: EmailOptions,
    ) -> Result<EmailSendResult, ExecutorError>;
}

/// Sender that logs instead of delivering; for local runs and tests
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(
        &self,
        account_id: Uuid,
        options: EmailOptions,
    ) -> Result<EmailSendResult, ExecutorError> {
        info!(
            %account_id,
            to = ?options.to,
            subject = %options.subject,
            "email send (log-only sender)"
        );
        Ok(EmailSendResult {
            success: true,
            message_id: Some(format!("log-{}", Uuid::new_v4())),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sender_succeeds() {
        let sender = LogEmailSender;
        let result = sender
            .send(
                Uuid::now_v7(),
                EmailOptions {
                    to: vec!["test@example.com".to_string()],
                    subject: "hi".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message_id.is_some());
    }

    #[test]
    fn test_options_serde_defaults() {
        let options: EmailOptions =
            serde_json::from_value(serde_json::json!({"to": ["a@b.c"], "subject": "s"})).unwrap();
        assert!(options.cc.is_empty());
        assert!(options.text.is_none());

        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("cc").is_none());
    }
}
