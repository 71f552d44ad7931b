//! Resource caps enforced by the runner
//!
//! Exceeding any cap fails the execution with a message carrying the
//! `limit`/`exceeded`/`maximum` keywords so the UI can show its limits
//! diagnostic.

use std::time::Duration;

/// Per-execution resource limits
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Maximum node executions per run (loop iterations included)
    pub max_nodes: usize,

    /// Maximum iterations across all loops in one execution
    pub max_loop_iterations: usize,

    /// Maximum loop nesting depth
    pub max_nesting_depth: usize,

    /// Maximum serialized size of any node output (documented to users at 10 MiB)
    pub max_data_bytes: usize,

    /// Maximum serialized size of a loop accumulator
    pub max_accumulator_bytes: usize,

    /// Wall-clock limit for one node executor call
    pub node_timeout: Duration,

    /// Wall-clock limit for one runner pass over an execution
    pub execution_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_nodes: 1_000,
            max_loop_iterations: 10_000,
            max_nesting_depth: 10,
            max_data_bytes: 10 * 1024 * 1024,
            max_accumulator_bytes: 10 * 1024 * 1024,
            node_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(600),
        }
    }
}

impl ExecutionLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_nodes(mut self, max: usize) -> Self {
        self.max_nodes = max.max(1);
        self
    }

    pub fn with_max_loop_iterations(mut self, max: usize) -> Self {
        self.max_loop_iterations = max.max(1);
        self
    }

    pub fn with_max_nesting_depth(mut self, max: usize) -> Self {
        self.max_nesting_depth = max.max(1);
        self
    }

    pub fn with_max_data_bytes(mut self, max: usize) -> Self {
        self.max_data_bytes = max;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Message for a node-count violation
    pub fn node_count_message(&self) -> String {
        format!("node limit exceeded: maximum {} nodes per execution", self.max_nodes)
    }

    /// Message for a loop-iteration violation
    pub fn iterations_message(&self) -> String {
        format!(
            "iteration limit exceeded: maximum {} loop iterations",
            self.max_loop_iterations
        )
    }

    /// Message for a nesting-depth violation
    pub fn depth_message(&self) -> String {
        format!(
            "nesting limit exceeded: maximum loop depth {}",
            self.max_nesting_depth
        )
    }

    /// Message for a data-size violation
    pub fn data_size_message(&self, actual: usize) -> String {
        format!(
            "data size limit exceeded: {} bytes, maximum {} bytes",
            actual, self.max_data_bytes
        )
    }

    /// Message for an accumulator-size violation
    pub fn accumulator_size_message(&self) -> String {
        format!(
            "accumulator size limit exceeded: maximum {} bytes",
            self.max_accumulator_bytes
        )
    }

    /// Message for a node timeout
    pub fn node_timeout_message(&self, node_id: &str) -> String {
        format!(
            "node {} timeout exceeded after {} seconds",
            node_id,
            self.node_timeout.as_secs()
        )
    }
}

/// Whether a failure message belongs to the limits diagnostic class.
pub fn is_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["limit", "exceeded", "maximum", "timeout", "depth", "iterations"]
        .iter()
        .any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.max_nodes, 1_000);
        assert_eq!(limits.max_data_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_builder() {
        let limits = ExecutionLimits::new()
            .with_max_nodes(5)
            .with_max_nesting_depth(2)
            .with_node_timeout(Duration::from_secs(1));
        assert_eq!(limits.max_nodes, 5);
        assert_eq!(limits.max_nesting_depth, 2);
        assert_eq!(limits.node_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_limit_messages_are_recognizable() {
        let limits = ExecutionLimits::default();
        for msg in [
            limits.node_count_message(),
            limits.iterations_message(),
            limits.depth_message(),
            limits.data_size_message(123),
            limits.accumulator_size_message(),
            limits.node_timeout_message("n-1"),
        ] {
            assert!(is_limit_message(&msg), "not recognized: {msg}");
        }
        assert!(!is_limit_message("connection refused"));
    }
}
