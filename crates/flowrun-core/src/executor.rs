//! Node executor capability
//!
//! One operation per node kind. Executors are stateless; instances may be
//! shared across executions. State lives in the [`ExecutionContext`] and the
//! store.

use async_trait::async_trait;

use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::ExecutorError;

/// Capability implemented by every node kind
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    /// Run one attempt.
    ///
    /// Business failures are `Ok` with `success = false`; `Err` is reserved
    /// for engine-class failures (infrastructure, programming errors) and
    /// bubbles to the job queue.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError>;

    /// Validate the kind-specific config at workflow save/trigger time, so
    /// malformed configs never fail mid-execution. The caller attaches the
    /// node id and kind to the message.
    fn validate_config(&self, _config: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}
