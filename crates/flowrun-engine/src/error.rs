//! Engine error type

use flowrun_core::{ExecutorError, ValidationError};
use flowrun_nodes::RegistryError;
use flowrun_storage::StoreError;
use uuid::Uuid;

/// Errors from the DAG runner, outbox worker, and scheduler
///
/// These are the engine-class failures that bubble to the job queue for
/// retry. Node business failures never become an `EngineError`; they fail the
/// execution fail-fast.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed definition
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Engine-class failure inside an executor
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A resource cap was exceeded
    #[error("{0}")]
    LimitExceeded(String),

    /// Execution in a state the operation does not accept
    #[error("execution {execution_id} is {status}, {operation} is not legal")]
    IllegalState {
        execution_id: Uuid,
        status: String,
        operation: &'static str,
    },
}
