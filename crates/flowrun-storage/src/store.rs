//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrun_core::{ExecutionStatus, NodeExecutionStatus, TriggerType, WorkflowDefinition};
use uuid::Uuid;

use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow version not found
    #[error("workflow {workflow_id} has no version {version}")]
    VersionNotFound { workflow_id: Uuid, version: i32 },

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Node execution not found
    #[error("node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),

    /// Outbox message not found
    #[error("outbox message not found: {0}")]
    MessageNotFound(Uuid),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Compare-and-set precondition failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Input for creating an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: Uuid,
    pub version: i32,
    pub trigger_type: TriggerType,
    pub input: serde_json::Value,
}

/// Input for creating a node execution row
#[derive(Debug, Clone)]
pub struct NewNodeExecution {
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub input: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub parent_loop_node_id: Option<String>,
}

impl NewNodeExecution {
    pub fn running(
        execution_id: Uuid,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeExecutionStatus::Running,
            input: Some(input),
            idempotency_key: None,
            parent_loop_node_id: None,
        }
    }

    pub fn with_parent_loop(mut self, loop_node_id: impl Into<String>) -> Self {
        self.parent_loop_node_id = Some(loop_node_id.into());
        self
    }
}

/// Input for an outbox message, enqueued atomically with its node execution
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub idempotency_key: String,
}

/// A claimed outbox message ready for processing
#[derive(Debug, Clone)]
pub struct ClaimedOutboxMessage {
    pub id: Uuid,
    pub node_execution_id: Uuid,
    pub execution_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Attempt number after the claim (1-based)
    pub attempts: i32,
    pub max_attempts: i32,
    pub idempotency_key: String,
}

/// Outcome of failing an outbox message
#[derive(Debug, Clone)]
pub enum OutboxFailureOutcome {
    /// Requeued with backoff
    WillRetry { next_retry_at: DateTime<Utc> },

    /// Moved to dead letter; companion node execution marked error
    DeadLettered,
}

/// Input for a sleep schedule
#[derive(Debug, Clone)]
pub struct NewSleepSchedule {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub wake_up_at: DateTime<Utc>,
}

/// Input for a job queue entry
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub input: serde_json::Value,
    pub trigger_type: TriggerType,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn workflow_run(
        workflow_id: Uuid,
        execution_id: Uuid,
        input: serde_json::Value,
        trigger_type: TriggerType,
    ) -> Self {
        Self {
            queue: "workflow".to_string(),
            workflow_id,
            execution_id,
            input,
            trigger_type,
            max_attempts: 3,
        }
    }
}

/// A claimed job
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub queue: String,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub input: serde_json::Value,
    pub trigger_type: TriggerType,
    pub attempt: i32,
    pub max_attempts: i32,
}

/// Outcome of failing a job
#[derive(Debug, Clone)]
pub enum JobFailureOutcome {
    WillRetry { next_attempt: i32, delay: Duration },
    Failed,
}

/// Retry backoff for outbox messages: `min(2^(attempts-1) minutes, 1 hour)`.
///
/// Attempt failures 1, 2, 3 wait 1, 2, 4 minutes.
pub fn outbox_backoff(attempts: i32) -> chrono::Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
    let minutes = 2i64.saturating_pow(exponent).min(60);
    chrono::Duration::minutes(minutes)
}

/// Retry backoff for queue jobs: `min(2^attempt seconds, 60 seconds)`.
pub fn job_backoff(attempt: i32) -> Duration {
    let exponent = attempt.clamp(0, 30) as u32;
    Duration::from_secs(2u64.saturating_pow(exponent).min(60))
}

/// Store for workflow state, the outbox, sleep schedules, and the job queue
///
/// Implementations must be thread-safe. Claim operations are compare-and-set
/// and safe against concurrent workers; the operations documented as
/// transactional are atomic with respect to crashes.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflows and versions
    // =========================================================================

    async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRecord, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord, StoreError>;

    async fn set_workflow_schedule(
        &self,
        id: Uuid,
        schedule: Option<String>,
        timezone: Option<String>,
    ) -> Result<(), StoreError>;

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;

    /// Delete a workflow; cascades to versions, executions, node executions,
    /// outbox messages, sleep schedules, and jobs.
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError>;

    /// Active workflows with a non-empty cron schedule
    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Create the next version (monotonically increasing) and point
    /// `current_version` at it.
    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<i32, StoreError>;

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowVersionRecord, StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    async fn create_execution(&self, input: NewExecution) -> Result<ExecutionRecord, StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Compare-and-set status transition. Returns false (without error) when
    /// the current status is not in `from`.
    async fn transition_execution(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool, StoreError>;

    /// Set a terminal status with output or error. Terminal statuses are
    /// sticky: returns false when the execution is already terminal.
    async fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError>;

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    // =========================================================================
    // Node executions
    // =========================================================================

    async fn insert_node_execution(
        &self,
        input: NewNodeExecution,
    ) -> Result<NodeExecutionRecord, StoreError>;

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, StoreError>;

    /// Latest successful output per node id, for checkpoint resume
    async fn successful_node_outputs(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError>;

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Insert the pending node execution row and its outbox message in ONE
    /// transaction. No phantom side effect is ever queued for a step that did
    /// not checkpoint.
    async fn enqueue_outbox(
        &self,
        node: NewNodeExecution,
        message: NewOutboxMessage,
    ) -> Result<(Uuid, Uuid), StoreError>;

    /// Claim due pending messages (status pending, next_retry_at <= now),
    /// oldest first. Transitions each to processing and bumps attempts.
    async fn claim_due_outbox(
        &self,
        limit: usize,
    ) -> Result<Vec<ClaimedOutboxMessage>, StoreError>;

    /// Mark the message completed and its node execution successful, in one
    /// transaction.
    async fn complete_outbox(
        &self,
        message_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Requeue with backoff, or dead-letter after max attempts (updating the
    /// companion node execution to error in the same transaction).
    async fn fail_outbox(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<OutboxFailureOutcome, StoreError>;

    /// Operator action: reset a dead-letter message to pending with
    /// attempts = 0 and cleared error fields.
    async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), StoreError>;

    /// Messages still pending or processing for an execution
    async fn open_outbox_count(&self, execution_id: Uuid) -> Result<usize, StoreError>;

    async fn dead_letter_count(&self, execution_id: Uuid) -> Result<usize, StoreError>;

    // =========================================================================
    // Sleep schedules
    // =========================================================================

    /// Persist the sleep node's success, insert the schedule row, and
    /// transition the execution to sleeping, in one transaction.
    async fn schedule_sleep(
        &self,
        node_execution_id: Uuid,
        output: &serde_json::Value,
        schedule: NewSleepSchedule,
    ) -> Result<Uuid, StoreError>;

    async fn due_sleep_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SleepScheduleRecord>, StoreError>;

    /// Compare-and-set pending -> fired; false when already fired/cancelled.
    /// Idempotent against multiple scheduler instances.
    async fn fire_sleep_schedule(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn cancel_sleep_schedules(&self, execution_id: Uuid) -> Result<(), StoreError>;

    async fn pending_sleep_count(&self, execution_id: Uuid) -> Result<usize, StoreError>;

    // =========================================================================
    // Job queue
    // =========================================================================

    async fn enqueue_job(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Claim pending jobs from one queue (SKIP LOCKED in Postgres)
    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, StoreError>;

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Requeue with backoff or mark failed after max attempts
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<JobFailureOutcome, StoreError>;

    async fn heartbeat_job(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Jobs still pending or claimed for an execution. The outbox worker uses
    /// this to avoid finalizing an execution a runner is still driving.
    async fn active_job_count(&self, execution_id: Uuid) -> Result<usize, StoreError>;

    /// Reset claimed jobs without a recent heartbeat to pending and mark
    /// their still-running executions interrupted. Returns the reclaimed ids.
    async fn reclaim_stale_jobs(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_backoff_progression() {
        assert_eq!(outbox_backoff(1), chrono::Duration::minutes(1));
        assert_eq!(outbox_backoff(2), chrono::Duration::minutes(2));
        assert_eq!(outbox_backoff(3), chrono::Duration::minutes(4));
        assert_eq!(outbox_backoff(7), chrono::Duration::minutes(60));
        assert_eq!(outbox_backoff(30), chrono::Duration::minutes(60));
    }

    #[test]
    fn test_job_backoff_capped() {
        assert_eq!(job_backoff(0), Duration::from_secs(1));
        assert_eq!(job_backoff(1), Duration::from_secs(2));
        assert_eq!(job_backoff(3), Duration::from_secs(8));
        assert_eq!(job_backoff(10), Duration::from_secs(60));
    }
}
