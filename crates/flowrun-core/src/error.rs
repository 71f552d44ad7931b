//! Error taxonomy shared by executors and the engine
//!
//! Two failure channels exist for node executors:
//!
//! - a *business failure* is a normal return: `ExecutionResult` with
//!   `success = false`. It fails the execution but never bubbles to the job
//!   queue.
//! - an *engine error* is `Err(ExecutorError)`: unexpected infrastructure or
//!   programming failure. It is recorded on the node execution row and
//!   propagates to the queue, which applies its retry policy.

use uuid::Uuid;

/// Malformed definition or configuration, surfaced at save/trigger time
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// No start node in the definition
    #[error("workflow definition has no start node")]
    MissingStart,

    /// More than one start node
    #[error("workflow definition has {0} start nodes, expected exactly one")]
    MultipleStarts(usize),

    /// Duplicate node id
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// Edge references a node that does not exist
    #[error("edge {edge_id} references unknown node: {node_id}")]
    UnknownEdgeTarget { edge_id: String, node_id: String },

    /// Node kind not present in the executor registry
    #[error("unknown node type: {0}")]
    UnknownNodeKind(String),

    /// A cycle that is not a loop-accumulator feedback edge
    #[error("workflow definition contains a cycle through node: {0}")]
    Cycle(String),

    /// Invalid cron expression on the workflow schedule
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },

    /// Invalid sleep node configuration
    #[error("invalid sleep config: {0}")]
    InvalidSleepConfig(String),

    /// Kind-specific config rejected at save/trigger time
    #[error("invalid {kind} config on node {node_id}: {message}")]
    InvalidNodeConfig {
        kind: String,
        node_id: String,
        message: String,
    },
}

/// Engine-class failure inside a node executor
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Kind-specific config did not have the expected shape
    #[error("invalid node config: {0}")]
    InvalidConfig(String),

    /// Input value did not have the expected shape
    #[error("invalid node input: {0}")]
    InvalidInput(String),

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(String),

    /// HTTP transport failure (not a non-2xx response)
    #[error("http error: {0}")]
    Http(String),

    /// Condition expression failed to parse or evaluate
    #[error("expression error: {0}")]
    Expression(String),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cancellation was observed mid-execution
    #[error("execution {0} cancelled")]
    Cancelled(Uuid),

    /// Anything else that indicates an engine bug or infrastructure failure
    #[error("{0}")]
    Internal(String),
}

impl ExecutorError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        let err = ValidationError::MultipleStarts(3);
        assert!(err.to_string().contains("3 start nodes"));

        let err = ValidationError::Cycle("n-7".to_string());
        assert!(err.to_string().contains("cycle"));
        assert!(err.to_string().contains("n-7"));
    }

    #[test]
    fn test_executor_error_helpers() {
        let err = ExecutorError::invalid_config("missing url");
        assert_eq!(err.to_string(), "invalid node config: missing url");
    }
}
