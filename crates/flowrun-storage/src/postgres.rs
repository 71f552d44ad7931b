//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence with:
//! - Single-transaction outbox enqueue (node execution + message)
//! - Efficient claiming with SKIP LOCKED (outbox and job queue)
//! - Compare-and-set status transitions for executions and sleep schedules

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrun_core::{ExecutionStatus, WorkflowDefinition};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::models::*;
use crate::store::*;

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use flowrun_storage::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowrun").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const TERMINAL_STATUSES: [&str; 4] = ["success", "error", "partially_failed", "cancelled"];

fn map_workflow(row: &PgRow) -> WorkflowRecord {
    WorkflowRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        is_active: row.get("is_active"),
        current_version: row.get("current_version"),
        schedule: row.get("schedule"),
        timezone: row.get("timezone"),
        webhook_path: row.get("webhook_path"),
        webhook_secret_hash: row.get("webhook_secret_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_execution(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    let trigger_type: String = row.get("trigger_type");
    Ok(ExecutionRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        status: status.parse().map_err(StoreError::Database)?,
        trigger_type: trigger_type.parse().map_err(StoreError::Database)?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn map_node_execution(row: &PgRow) -> Result<NodeExecutionRecord, StoreError> {
    let status: String = row.get("status");
    Ok(NodeExecutionRecord {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        status: status.parse().map_err(StoreError::Database)?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        idempotency_key: row.get("idempotency_key"),
        parent_loop_node_id: row.get("parent_loop_node_id"),
    })
}

fn map_sleep_schedule(row: &PgRow) -> Result<SleepScheduleRecord, StoreError> {
    let status: String = row.get("status");
    Ok(SleepScheduleRecord {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        workflow_id: row.get("workflow_id"),
        node_id: row.get("node_id"),
        wake_up_at: row.get("wake_up_at"),
        status: status.parse().map_err(StoreError::Database)?,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, input))]
    async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflows (id, account_id, name, schedule, timezone, webhook_path, webhook_secret_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, account_id, name, is_active, current_version, schedule, timezone,
                      webhook_path, webhook_secret_hash, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.account_id)
        .bind(&input.name)
        .bind(&input.schedule)
        .bind(&input.timezone)
        .bind(&input.webhook_path)
        .bind(&input.webhook_secret_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let workflow = map_workflow(&row);
        debug!(workflow_id = %workflow.id, "created workflow");
        Ok(workflow)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, name, is_active, current_version, schedule, timezone,
                   webhook_path, webhook_secret_hash, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowNotFound(id))?;

        Ok(map_workflow(&row))
    }

    #[instrument(skip(self))]
    async fn set_workflow_schedule(
        &self,
        id: Uuid,
        schedule: Option<String>,
        timezone: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET schedule = $2,
                timezone = COALESCE($3, timezone),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&schedule)
        .bind(&timezone)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows SET is_active = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        // Child tables cascade via foreign keys
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete workflow: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        debug!(workflow_id = %id, "deleted workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, name, is_active, current_version, schedule, timezone,
                   webhook_path, webhook_secret_hash, created_at, updated_at
            FROM workflows
            WHERE is_active AND schedule IS NOT NULL AND schedule <> ''
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(map_workflow).collect())
    }

    #[instrument(skip(self, definition))]
    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<i32, StoreError> {
        let definition_json = serde_json::to_value(definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Lock the workflow row so version numbers stay monotonic
        let locked = sqlx::query("SELECT id FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if locked.is_none() {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1 AS next_version
            FROM workflow_versions
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        let next_version: i32 = row.get("next_version");

        sqlx::query(
            r#"
            INSERT INTO workflow_versions (id, workflow_id, version, definition)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(next_version)
        .bind(&definition_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE workflows SET current_version = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(next_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%workflow_id, next_version, "created workflow version");
        Ok(next_version)
    }

    #[instrument(skip(self))]
    async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowVersionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, definition, created_at
            FROM workflow_versions
            WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::VersionNotFound {
            workflow_id,
            version,
        })?;

        Ok(WorkflowVersionRecord {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            version: row.get("version"),
            definition: row.get("definition"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self, input))]
    async fn create_execution(&self, input: NewExecution) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, version, status, trigger_type, input)
            VALUES ($1, $2, $3, 'queued', $4, $5)
            RETURNING id, workflow_id, version, status, trigger_type, input, output, error,
                      started_at, completed_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.workflow_id)
        .bind(input.version)
        .bind(input.trigger_type.to_string())
        .bind(&input.input)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create execution: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let execution = map_execution(&row)?;
        debug!(execution_id = %execution.id, trigger = %execution.trigger_type, "created execution");
        Ok(execution)
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, status, trigger_type, input, output, error,
                   started_at, completed_at
            FROM workflow_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ExecutionNotFound(id))?;

        map_execution(&row)
    }

    #[instrument(skip(self))]
    async fn transition_execution(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let from_strings: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let clear_completed = !to.is_terminal();
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2,
                completed_at = CASE WHEN $4 THEN NULL ELSE completed_at END
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(&from_strings)
        .bind(clear_completed)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() > 0 {
            debug!(execution_id = %id, to = %to, "transitioned execution");
            return Ok(true);
        }

        // Distinguish a failed precondition from a missing row
        let exists = sqlx::query("SELECT 1 FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if exists.is_none() {
            return Err(StoreError::ExecutionNotFound(id));
        }
        Ok(false)
    }

    #[instrument(skip(self, output, error))]
    async fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let completed_at: Option<DateTime<Utc>> =
            status.is_terminal().then(Utc::now);

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2,
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                completed_at = COALESCE($5, completed_at)
            WHERE id = $1 AND status <> ALL($6)
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(&output)
        .bind(&error)
        .bind(completed_at)
        .bind(&TERMINAL_STATUSES.map(String::from)[..])
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() > 0 {
            debug!(execution_id = %id, %status, "completed execution");
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if exists.is_none() {
            return Err(StoreError::ExecutionNotFound(id));
        }
        Ok(false)
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, version, status, trigger_type, input, output, error,
                   started_at, completed_at
            FROM workflow_executions
            WHERE workflow_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(map_execution).collect()
    }

    #[instrument(skip(self, input))]
    async fn insert_node_execution(
        &self,
        input: NewNodeExecution,
    ) -> Result<NodeExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_node_executions
                (id, execution_id, node_id, node_type, status, input, idempotency_key, parent_loop_node_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, execution_id, node_id, node_type, status, input, output, error,
                      started_at, completed_at, idempotency_key, parent_loop_node_id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.execution_id)
        .bind(&input.node_id)
        .bind(&input.node_type)
        .bind(input.status.to_string())
        .bind(&input.input)
        .bind(&input.idempotency_key)
        .bind(&input.parent_loop_node_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert node execution: {}", e);
            StoreError::Database(e.to_string())
        })?;

        map_node_execution(&row)
    }

    #[instrument(skip(self, output))]
    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_node_executions
            SET status = 'success', output = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(output)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NodeExecutionNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_node_executions
            SET status = 'error', error = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NodeExecutionNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, node_id, node_type, status, input, output, error,
                   started_at, completed_at, idempotency_key, parent_loop_node_id
            FROM workflow_node_executions
            WHERE execution_id = $1
            ORDER BY started_at, id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(map_node_execution).collect()
    }

    #[instrument(skip(self))]
    async fn successful_node_outputs(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (node_id) node_id, output
            FROM workflow_node_executions
            WHERE execution_id = $1 AND status = 'success'
            ORDER BY node_id, started_at DESC, id DESC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let output: Option<serde_json::Value> = row.get("output");
                (row.get("node_id"), output.unwrap_or(serde_json::Value::Null))
            })
            .collect())
    }

    #[instrument(skip(self, node, message))]
    async fn enqueue_outbox(
        &self,
        node: NewNodeExecution,
        message: NewOutboxMessage,
    ) -> Result<(Uuid, Uuid), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let node_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflow_node_executions
                (id, execution_id, node_id, node_type, status, input, idempotency_key, parent_loop_node_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(node_id)
        .bind(node.execution_id)
        .bind(&node.node_id)
        .bind(&node.node_type)
        .bind(node.status.to_string())
        .bind(&node.input)
        .bind(&node.idempotency_key)
        .bind(&node.parent_loop_node_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let message_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO outbox_messages
                (id, node_execution_id, execution_id, event_type, payload, status,
                 max_attempts, next_retry_at, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, NOW(), $7)
            "#,
        )
        .bind(message_id)
        .bind(node_id)
        .bind(node.execution_id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.max_attempts)
        .bind(&message.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%message_id, event_type = %message.event_type, "enqueued outbox message");
        Ok((node_id, message_id))
    }

    #[instrument(skip(self))]
    async fn claim_due_outbox(
        &self,
        limit: usize,
    ) -> Result<Vec<ClaimedOutboxMessage>, StoreError> {
        // SKIP LOCKED keeps concurrent outbox workers from contending
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox_messages
                WHERE status = 'pending'
                  AND next_retry_at <= NOW()
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages m
            SET status = 'processing',
                attempts = attempts + 1,
                last_attempt_at = NOW()
            FROM claimable c
            WHERE m.id = c.id
            RETURNING m.id, m.node_execution_id, m.execution_id, m.event_type,
                      m.payload, m.attempts, m.max_attempts, m.idempotency_key
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim outbox messages: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let claimed: Vec<ClaimedOutboxMessage> = rows
            .into_iter()
            .map(|row| ClaimedOutboxMessage {
                id: row.get("id"),
                node_execution_id: row.get("node_execution_id"),
                execution_id: row.get("execution_id"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                attempts: row.get("attempts"),
                max_attempts: row.get("max_attempts"),
                idempotency_key: row.get("idempotency_key"),
            })
            .collect();

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed outbox messages");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, output))]
    async fn complete_outbox(
        &self,
        message_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'completed', processed_at = NOW()
            WHERE id = $1
            RETURNING node_execution_id
            "#,
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::MessageNotFound(message_id))?;

        let node_execution_id: Uuid = row.get("node_execution_id");
        sqlx::query(
            r#"
            UPDATE workflow_node_executions
            SET status = 'success', output = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(node_execution_id)
        .bind(output)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%message_id, "completed outbox message");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_outbox(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<OutboxFailureOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts, node_execution_id
            FROM outbox_messages
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::MessageNotFound(message_id))?;

        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let node_execution_id: Uuid = row.get("node_execution_id");

        let outcome = if attempts < max_attempts {
            let next_retry_at = Utc::now() + outbox_backoff(attempts);
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET status = 'pending', next_retry_at = $2, last_error = $3
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(next_retry_at)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            debug!(%message_id, attempts, "outbox message will retry");
            OutboxFailureOutcome::WillRetry { next_retry_at }
        } else {
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET status = 'dead_letter', last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            sqlx::query(
                r#"
                UPDATE workflow_node_executions
                SET status = 'error', error = $2, completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(node_execution_id)
            .bind(format!("Failed after {attempts} attempts: {error}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            debug!(%message_id, "outbox message dead-lettered");
            OutboxFailureOutcome::DeadLettered
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', attempts = 0, next_retry_at = NOW(), last_error = NULL
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "message {message_id} is not dead-lettered"
            )));
        }
        debug!(%message_id, "dead-letter message requeued");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn open_outbox_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS open_count
            FROM outbox_messages
            WHERE execution_id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("open_count") as usize)
    }

    #[instrument(skip(self))]
    async fn dead_letter_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS dead_count
            FROM outbox_messages
            WHERE execution_id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("dead_count") as usize)
    }

    #[instrument(skip(self, output, schedule))]
    async fn schedule_sleep(
        &self,
        node_execution_id: Uuid,
        output: &serde_json::Value,
        schedule: NewSleepSchedule,
    ) -> Result<Uuid, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE workflow_node_executions
            SET status = 'success', output = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(node_execution_id)
        .bind(output)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let schedule_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO sleep_schedules (id, execution_id, workflow_id, node_id, wake_up_at, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            "#,
        )
        .bind(schedule_id)
        .bind(schedule.execution_id)
        .bind(schedule.workflow_id)
        .bind(&schedule.node_id)
        .bind(schedule.wake_up_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'sleeping'
            WHERE id = $1 AND status <> ALL($2)
            "#,
        )
        .bind(schedule.execution_id)
        .bind(&TERMINAL_STATUSES.map(String::from)[..])
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "execution {} is terminal, cannot sleep",
                schedule.execution_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(execution_id = %schedule.execution_id, wake_up_at = %schedule.wake_up_at, "scheduled sleep");
        Ok(schedule_id)
    }

    #[instrument(skip(self))]
    async fn due_sleep_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SleepScheduleRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, workflow_id, node_id, wake_up_at, status, created_at
            FROM sleep_schedules
            WHERE status = 'pending' AND wake_up_at <= $1
            ORDER BY wake_up_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(map_sleep_schedule).collect()
    }

    #[instrument(skip(self))]
    async fn fire_sleep_schedule(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sleep_schedules
            SET status = 'fired'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn cancel_sleep_schedules(&self, execution_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sleep_schedules
            SET status = 'cancelled'
            WHERE execution_id = $1 AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pending_sleep_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending_count
            FROM sleep_schedules
            WHERE execution_id = $1 AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("pending_count") as usize)
    }

    #[instrument(skip(self, job))]
    async fn enqueue_job(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let job_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO job_queue
                (id, queue, workflow_id, execution_id, input, trigger_type, status, max_attempts, visible_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, NOW())
            "#,
        )
        .bind(job_id)
        .bind(&job.queue)
        .bind(job.workflow_id)
        .bind(job.execution_id)
        .bind(&job.input)
        .bind(job.trigger_type.to_string())
        .bind(job.max_attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%job_id, queue = %job.queue, "enqueued job");
        Ok(job_id)
    }

    #[instrument(skip(self))]
    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM job_queue
                WHERE queue = $1
                  AND status = 'pending'
                  AND visible_at <= NOW()
                ORDER BY visible_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue j
            SET status = 'claimed',
                claimed_by = $3,
                heartbeat_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.id, j.queue, j.workflow_id, j.execution_id, j.input,
                      j.trigger_type, j.attempt, j.max_attempts
            "#,
        )
        .bind(queue)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let trigger_type: String = row.get("trigger_type");
            claimed.push(ClaimedJob {
                id: row.get("id"),
                queue: row.get("queue"),
                workflow_id: row.get("workflow_id"),
                execution_id: row.get("execution_id"),
                input: row.get("input"),
                trigger_type: trigger_type.parse().map_err(StoreError::Database)?,
                attempt: row.get("attempt"),
                max_attempts: row.get("max_attempts"),
            });
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue SET status = 'completed' WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        debug!(%job_id, "completed job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<JobFailureOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT attempt, max_attempts
            FROM job_queue
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");

        if attempt < max_attempts {
            let delay = job_backoff(attempt);
            let visible_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'pending',
                    claimed_by = NULL,
                    heartbeat_at = NULL,
                    last_error = $2,
                    visible_at = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            debug!(%job_id, next_attempt = attempt + 1, "job will retry");
            Ok(JobFailureOutcome::WillRetry {
                next_attempt: attempt + 1,
                delay,
            })
        } else {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'failed', last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            debug!(%job_id, "job failed permanently");
            Ok(JobFailureOutcome::Failed)
        }
    }

    #[instrument(skip(self))]
    async fn heartbeat_job(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET heartbeat_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn active_job_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS active_count
            FROM job_queue
            WHERE execution_id = $1 AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("active_count") as usize)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_jobs(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending',
                claimed_by = NULL,
                heartbeat_at = NULL
            WHERE status = 'claimed'
              AND heartbeat_at < $1
            RETURNING id, execution_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stale jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        let executions: Vec<Uuid> = rows.iter().map(|r| r.get("execution_id")).collect();

        if !executions.is_empty() {
            sqlx::query(
                r#"
                UPDATE workflow_executions
                SET status = 'interrupted'
                WHERE id = ANY($1) AND status = 'running'
                "#,
            )
            .bind(&executions)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale jobs");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database; the in-memory store
    // covers the trait semantics. Run against Postgres with:
    // DATABASE_URL=postgres://... cargo test -p flowrun-storage
}
