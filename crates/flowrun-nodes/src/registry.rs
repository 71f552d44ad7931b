//! Executor registry
//!
//! Maps node kinds to executors and classifies each kind as synchronous or
//! outbox-deferred. The registry is stateless; executors are shared immutable
//! instances and all execution state lives in the context and the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use flowrun_core::definition::{is_marker, kinds};
use flowrun_core::{EmailSender, NodeExecutor};
use serde_json::Value;

use crate::conditional::ConditionalExecutor;
use crate::csv_export::JsonToCsvExecutor;
use crate::email::EmailExecutor;
use crate::http::{shared_client, HttpExecutor};
use crate::json::{JsonArrayExecutor, JsonExecutor};
use crate::loops::LoopExecutor;
use crate::slack::SlackExecutor;
use crate::timing::{DelayExecutor, SleepExecutor};
use crate::transform::TransformExecutor;

/// Outbox event types
pub mod events {
    pub const EMAIL_SEND: &str = "email.send";
    pub const HTTP_REQUEST: &str = "http.request";
    pub const SLACK_SEND: &str = "slack.send";

    /// Node kind handling an event type
    pub fn kind_for(event_type: &str) -> Option<&'static str> {
        match event_type {
            EMAIL_SEND => Some(super::kinds::EMAIL),
            HTTP_REQUEST => Some(super::kinds::HTTP),
            SLACK_SEND => Some(super::kinds::SLACK),
            _ => None,
        }
    }
}

/// How the runner handles a node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Run inline inside the DAG runner
    Sync,

    /// Queue transactionally; the outbox worker runs the executor later
    Outbox { event_type: &'static str },
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Node kind not registered
    #[error("unknown node type: {0}")]
    UnknownNodeKind(String),

    /// Event type without a registered handler
    #[error("unknown outbox event type: {0}")]
    UnknownEventType(String),
}

/// Registry of node executors
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with every built-in kind registered.
    ///
    /// The HTTP client is shared across the http and slack executors with
    /// bounded pools; the email sender is the injected capability.
    pub fn standard(email_sender: Arc<dyn EmailSender>) -> Self {
        let client = shared_client();
        let mut registry = Self::new();
        registry.register(kinds::JSON, Arc::new(JsonExecutor));
        registry.register(kinds::JSON_ARRAY, Arc::new(JsonArrayExecutor));
        registry.register(kinds::TRANSFORM, Arc::new(TransformExecutor));
        registry.register(kinds::CONDITIONAL, Arc::new(ConditionalExecutor));
        registry.register(kinds::DELAY, Arc::new(DelayExecutor));
        registry.register(kinds::SLEEP, Arc::new(SleepExecutor));
        registry.register(kinds::HTTP, Arc::new(HttpExecutor::new(client.clone())));
        registry.register(kinds::EMAIL, Arc::new(EmailExecutor::new(email_sender)));
        registry.register(kinds::SLACK, Arc::new(SlackExecutor::new(client)));
        registry.register(kinds::JSON_TO_CSV, Arc::new(JsonToCsvExecutor));
        registry.register(kinds::LOOP, Arc::new(LoopExecutor));
        registry.register(kinds::LOOP_ACCUMULATOR, Arc::new(LoopExecutor));
        registry
    }

    /// Register (or replace) an executor for a kind
    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(kind.into(), executor);
    }

    /// Whether a kind is executable or a graph marker
    pub fn is_known(&self, kind: &str) -> bool {
        is_marker(kind) || self.executors.contains_key(kind)
    }

    /// Fetch the executor for a kind
    pub fn get(&self, kind: &str) -> Result<Arc<dyn NodeExecutor>, RegistryError> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNodeKind(kind.to_string()))
    }

    /// Fetch the executor handling an outbox event type
    pub fn get_for_event(&self, event_type: &str) -> Result<Arc<dyn NodeExecutor>, RegistryError> {
        let kind = events::kind_for(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))?;
        self.get(kind)
    }

    /// Classify a kind for the runner.
    ///
    /// Outbox-deferred kinds are exactly those whose effects are externally
    /// observable and must survive crashes: `email`, `slack`, and `http` when
    /// its config opts into fire-and-forget delivery.
    pub fn dispatch(&self, kind: &str, config: &Value) -> Dispatch {
        match kind {
            k if k == kinds::EMAIL => Dispatch::Outbox {
                event_type: events::EMAIL_SEND,
            },
            k if k == kinds::SLACK => Dispatch::Outbox {
                event_type: events::SLACK_SEND,
            },
            k if k == kinds::HTTP
                && config
                    .get("fireAndForget")
                    .and_then(Value::as_bool)
                    .unwrap_or(false) =>
            {
                Dispatch::Outbox {
                    event_type: events::HTTP_REQUEST,
                }
            }
            _ => Dispatch::Sync,
        }
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::LogEmailSender;
    use serde_json::json;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::standard(Arc::new(LogEmailSender))
    }

    #[test]
    fn test_standard_kinds_known() {
        let registry = registry();
        for kind in [
            "json",
            "json-array",
            "transform",
            "conditional",
            "delay",
            "sleep",
            "http",
            "email",
            "slack",
            "json_to_csv",
            "loop",
            "loop-accumulator",
        ] {
            assert!(registry.is_known(kind), "kind not registered: {kind}");
            assert!(registry.get(kind).is_ok());
        }
        // Markers are known but have no executor
        assert!(registry.is_known("start"));
        assert!(registry.is_known("end"));
        assert!(registry.get("start").is_err());
        assert!(!registry.is_known("teleport"));
    }

    #[test]
    fn test_dispatch_classification() {
        let registry = registry();
        assert_eq!(
            registry.dispatch("email", &json!({})),
            Dispatch::Outbox { event_type: "email.send" }
        );
        assert_eq!(
            registry.dispatch("slack", &json!({})),
            Dispatch::Outbox { event_type: "slack.send" }
        );
        assert_eq!(registry.dispatch("http", &json!({})), Dispatch::Sync);
        assert_eq!(
            registry.dispatch("http", &json!({"fireAndForget": true})),
            Dispatch::Outbox { event_type: "http.request" }
        );
        assert_eq!(registry.dispatch("transform", &json!({})), Dispatch::Sync);
    }

    #[test]
    fn test_event_type_routing() {
        let registry = registry();
        assert!(registry.get_for_event("email.send").is_ok());
        assert!(registry.get_for_event("http.request").is_ok());
        assert!(registry.get_for_event("slack.send").is_ok());
        assert!(matches!(
            registry.get_for_event("pigeon.send"),
            Err(RegistryError::UnknownEventType(_))
        ));
    }
}
