//! Status enumerations persisted by the store
//!
//! These are closed sets; the wire strings match the database values.

use serde::{Deserialize, Serialize};

/// Workflow execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, waiting for a runner worker
    Queued,

    /// A runner worker is (or was) driving the graph
    Running,

    /// Suspended on a durable sleep; exactly one pending sleep schedule exists
    Sleeping,

    /// All nodes and side effects completed
    Success,

    /// A node failed (fail-fast) or the runner hit an engine error
    Error,

    /// Synchronous traversal succeeded but at least one side effect dead-lettered
    PartiallyFailed,

    /// Cancelled by operator action
    Cancelled,

    /// Worker died mid-run (stale job reclaimed); resumable from checkpoint
    Interrupted,
}

impl ExecutionStatus {
    /// Terminal statuses never change once set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::PartiallyFailed | Self::Cancelled
        )
    }

    /// Statuses from which an operator resume is legal.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Error | Self::PartiallyFailed | Self::Interrupted | Self::Sleeping
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Success => "success",
            Self::Error => "error",
            Self::PartiallyFailed => "partially_failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "partially_failed" => Ok(Self::PartiallyFailed),
            "cancelled" => Ok(Self::Cancelled),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Node execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    /// Row exists but no executor has run (outbox-deferred nodes)
    Pending,
    Running,
    Success,
    Error,
}

impl std::fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NodeExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown node execution status: {other}")),
        }
    }
}

/// Outbox message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    DeadLetter,
}

impl OutboxStatus {
    /// Open messages still block execution completion.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::DeadLetter => "dead_letter",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// Sleep schedule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStatus {
    Pending,
    Fired,
    Cancelled,
}

impl std::fmt::Display for SleepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SleepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "fired" => Ok(Self::Fired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown sleep status: {other}")),
        }
    }
}

/// Job status in the durable queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// How an execution was triggered (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Webhook,
    Resume,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
            Self::Resume => "resume",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "webhook" => Ok(Self::Webhook),
            "resume" => Ok(Self::Resume),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(ExecutionStatus::PartiallyFailed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Sleeping.is_terminal());
        assert!(!ExecutionStatus::Interrupted.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_resumable_statuses() {
        assert!(ExecutionStatus::Error.is_resumable());
        assert!(ExecutionStatus::Interrupted.is_resumable());
        assert!(!ExecutionStatus::Success.is_resumable());
        assert!(!ExecutionStatus::Queued.is_resumable());
    }

    #[test]
    fn test_wire_strings_round_trip() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Sleeping,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::PartiallyFailed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Interrupted,
        ] {
            let parsed = ExecutionStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(ExecutionStatus::PartiallyFailed.to_string(), "partially_failed");
        assert_eq!(OutboxStatus::DeadLetter.to_string(), "dead_letter");
    }

    #[test]
    fn test_open_outbox_statuses() {
        assert!(OutboxStatus::Pending.is_open());
        assert!(OutboxStatus::Processing.is_open());
        assert!(!OutboxStatus::Completed.is_open());
        assert!(!OutboxStatus::DeadLetter.is_open());
    }
}
