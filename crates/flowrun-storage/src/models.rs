//! Persisted records and creation inputs

use chrono::{DateTime, Utc};
use flowrun_core::{ExecutionStatus, NodeExecutionStatus, OutboxStatus, SleepStatus, TriggerType};
use uuid::Uuid;

/// Workflow row
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub current_version: i32,
    /// Cron expression; empty/None disables scheduling
    pub schedule: Option<String>,
    /// IANA timezone for the cron schedule and display
    pub timezone: String,
    pub webhook_path: Option<String>,
    /// bcrypt hash of the webhook bearer secret
    pub webhook_secret_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a workflow
#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub account_id: Uuid,
    pub name: String,
    pub schedule: Option<String>,
    pub timezone: String,
    pub webhook_path: Option<String>,
    pub webhook_secret_hash: Option<String>,
}

impl CreateWorkflow {
    pub fn new(account_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            account_id,
            name: name.into(),
            schedule: None,
            timezone: "UTC".to_string(),
            webhook_path: None,
            webhook_secret_hash: None,
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self.timezone = timezone.into();
        self
    }

    pub fn with_webhook(
        mut self,
        path: Option<String>,
        secret_hash: impl Into<String>,
    ) -> Self {
        self.webhook_path = path;
        self.webhook_secret_hash = Some(secret_hash.into());
        self
    }
}

/// Immutable workflow version row
#[derive(Debug, Clone)]
pub struct WorkflowVersionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Workflow execution row
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Version pinned at execution start; never changes
    pub version: i32,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Node execution row; retries create new rows
#[derive(Debug, Clone)]
pub struct NodeExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    /// Set on iteration-body rows so they group per loop iteration
    pub parent_loop_node_id: Option<String>,
}

/// Outbox message row
#[derive(Debug, Clone)]
pub struct OutboxMessageRecord {
    pub id: Uuid,
    pub node_execution_id: Uuid,
    pub execution_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Sleep schedule row
#[derive(Debug, Clone)]
pub struct SleepScheduleRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub wake_up_at: DateTime<Utc>,
    pub status: SleepStatus,
    pub created_at: DateTime<Utc>,
}
