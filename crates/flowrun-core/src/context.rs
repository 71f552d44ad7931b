//! Node execution context and result

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context provided to a node executor for one attempt
///
/// All execution state lives here and in the store; executors themselves are
/// stateless and may be shared.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Owning execution
    pub execution_id: Uuid,

    /// Account scope, for capabilities that need it (email)
    pub account_id: Uuid,

    /// Node id within the definition
    pub node_id: String,

    /// Kind-specific config map from the definition
    pub node_config: serde_json::Value,

    /// Output of the chosen upstream node, or the workflow input at the entry
    pub input: serde_json::Value,

    /// `{ "nodeOutputs": { <node_id>: <output> }, "input": <workflow input> }`
    pub workflow_data: serde_json::Value,

    /// Set when running from the outbox so providers can deduplicate
    pub idempotency_key: Option<String>,

    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        account_id: Uuid,
        node_id: impl Into<String>,
        node_config: serde_json::Value,
        input: serde_json::Value,
        workflow_data: serde_json::Value,
    ) -> Self {
        Self {
            execution_id,
            account_id,
            node_id: node_id.into(),
            node_config,
            input,
            workflow_data,
            idempotency_key: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach the outbox message's idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Share the cancellation flag of another context (loop iterations)
    pub fn with_cancellation_of(mut self, other: &ExecutionContext) -> Self {
        self.cancelled = other.cancelled.clone();
        self
    }

    /// Get a handle that can be used to cancel this execution
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves when cancellation is requested
    ///
    /// For select! patterns around sleeps and network calls:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     _ = tokio::time::sleep(duration) => {}
    ///     _ = ctx.cancelled() => return Err(ExecutorError::Cancelled(ctx.execution_id)),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

/// Handle to cancel an execution cooperatively
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Outcome of one node executor attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,

    /// Output map recorded on the node execution row and visible downstream
    #[serde(default)]
    pub output: serde_json::Value,

    /// Business failure message when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Durable suspension request; the runner persists a sleep schedule
    #[serde(default)]
    pub needs_sleep: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_up_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    /// Successful result with the given output map
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            needs_sleep: false,
            wake_up_at: None,
        }
    }

    /// Business failure
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            needs_sleep: false,
            wake_up_at: None,
        }
    }

    /// Successful result that suspends the execution until `wake_up_at`
    pub fn sleep(wake_up_at: DateTime<Utc>, output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            needs_sleep: true,
            wake_up_at: Some(wake_up_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "n-1",
            serde_json::json!({}),
            serde_json::json!({"a": 1}),
            serde_json::json!({"nodeOutputs": {}, "input": {}}),
        )
    }

    #[test]
    fn test_cancellation_handle() {
        let ctx = ctx();
        let handle = ctx.cancellation_handle();
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_shared_cancellation() {
        let outer = ctx();
        let inner = ctx().with_cancellation_of(&outer);
        outer.cancellation_handle().cancel();
        assert!(inner.is_cancelled());
    }

    #[test]
    fn test_result_constructors() {
        let ok = ExecutionResult::ok(serde_json::json!({"data": 1}));
        assert!(ok.success);
        assert!(!ok.needs_sleep);

        let fail = ExecutionResult::fail("boom");
        assert!(!fail.success);
        assert_eq!(fail.error.as_deref(), Some("boom"));

        let wake = Utc::now();
        let sleep = ExecutionResult::sleep(wake, serde_json::json!({}));
        assert!(sleep.success);
        assert!(sleep.needs_sleep);
        assert_eq!(sleep.wake_up_at, Some(wake));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let ctx = ctx();
        let handle = ctx.cancellation_handle();
        handle.cancel();
        // Must resolve promptly once the flag is set
        tokio::time::timeout(std::time::Duration::from_secs(1), ctx.cancelled())
            .await
            .expect("cancelled() should resolve");
    }
}
