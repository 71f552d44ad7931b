//! In-memory implementation of WorkflowStore for tests and local runs
//!
//! Same semantics as the PostgreSQL implementation, including
//! compare-and-set claims and sticky terminal statuses.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrun_core::{
    ExecutionStatus, JobStatus, NodeExecutionStatus, OutboxStatus, SleepStatus, TriggerType,
    WorkflowDefinition,
};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::*;
use crate::store::*;

struct JobState {
    id: Uuid,
    queue: String,
    workflow_id: Uuid,
    execution_id: Uuid,
    input: serde_json::Value,
    trigger_type: TriggerType,
    status: JobStatus,
    attempt: i32,
    max_attempts: i32,
    visible_at: DateTime<Utc>,
    claimed_by: Option<String>,
    heartbeat_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// In-memory implementation of WorkflowStore
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowRecord>>,
    versions: RwLock<HashMap<(Uuid, i32), WorkflowVersionRecord>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    node_executions: RwLock<Vec<NodeExecutionRecord>>,
    outbox: RwLock<HashMap<Uuid, OutboxMessageRecord>>,
    sleeps: RwLock<HashMap<Uuid, SleepScheduleRecord>>,
    jobs: RwLock<HashMap<Uuid, JobState>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            node_executions: RwLock::new(Vec::new()),
            outbox: RwLock::new(HashMap::new()),
            sleeps: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// All outbox messages for an execution (test helper)
    pub fn outbox_messages(&self, execution_id: Uuid) -> Vec<OutboxMessageRecord> {
        let mut messages: Vec<_> = self
            .outbox
            .read()
            .values()
            .filter(|m| m.execution_id == execution_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    /// All sleep schedules for an execution (test helper)
    pub fn sleep_schedules(&self, execution_id: Uuid) -> Vec<SleepScheduleRecord> {
        self.sleeps
            .read()
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Make a pending outbox message immediately due again (test helper for
    /// exercising retries without waiting out the backoff)
    pub fn make_outbox_due(&self, message_id: Uuid) {
        if let Some(message) = self.outbox.write().get_mut(&message_id) {
            message.next_retry_at = Utc::now();
        }
    }

    /// Move an execution's pending sleep schedules into the past (test helper)
    pub fn make_sleep_due(&self, execution_id: Uuid) {
        for schedule in self.sleeps.write().values_mut() {
            if schedule.execution_id == execution_id && schedule.status == SleepStatus::Pending {
                schedule.wake_up_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }
    }

    /// Number of pending jobs across all queues (test helper)
    pub fn pending_job_count(&self) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRecord, StoreError> {
        let now = Utc::now();
        let record = WorkflowRecord {
            id: Uuid::now_v7(),
            account_id: input.account_id,
            name: input.name,
            is_active: true,
            current_version: 0,
            schedule: input.schedule,
            timezone: input.timezone,
            webhook_path: input.webhook_path,
            webhook_secret_hash: input.webhook_secret_hash,
            created_at: now,
            updated_at: now,
        };
        self.workflows.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord, StoreError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn set_workflow_schedule(
        &self,
        id: Uuid,
        schedule: Option<String>,
        timezone: Option<String>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.schedule = schedule;
        if let Some(tz) = timezone {
            workflow.timezone = tz;
        }
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.is_active = active;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        if self.workflows.write().remove(&id).is_none() {
            return Err(StoreError::WorkflowNotFound(id));
        }
        self.versions.write().retain(|(wf, _), _| *wf != id);

        let removed_executions: Vec<Uuid> = {
            let mut executions = self.executions.write();
            let ids: Vec<Uuid> = executions
                .values()
                .filter(|e| e.workflow_id == id)
                .map(|e| e.id)
                .collect();
            for exec_id in &ids {
                executions.remove(exec_id);
            }
            ids
        };

        self.node_executions
            .write()
            .retain(|n| !removed_executions.contains(&n.execution_id));
        self.outbox
            .write()
            .retain(|_, m| !removed_executions.contains(&m.execution_id));
        self.sleeps.write().retain(|_, s| s.workflow_id != id);
        self.jobs.write().retain(|_, j| j.workflow_id != id);
        Ok(())
    }

    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|w| w.is_active && w.schedule.as_deref().is_some_and(|s| !s.is_empty()))
            .cloned()
            .collect())
    }

    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<i32, StoreError> {
        let definition_json = serde_json::to_value(definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let mut versions = self.versions.write();
        let next = versions
            .keys()
            .filter(|(wf, _)| *wf == workflow_id)
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(0)
            + 1;

        versions.insert(
            (workflow_id, next),
            WorkflowVersionRecord {
                id: Uuid::now_v7(),
                workflow_id,
                version: next,
                definition: definition_json,
                created_at: Utc::now(),
            },
        );
        workflow.current_version = next;
        workflow.updated_at = Utc::now();
        Ok(next)
    }

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowVersionRecord, StoreError> {
        self.versions
            .read()
            .get(&(workflow_id, version))
            .cloned()
            .ok_or(StoreError::VersionNotFound {
                workflow_id,
                version,
            })
    }

    async fn create_execution(&self, input: NewExecution) -> Result<ExecutionRecord, StoreError> {
        if !self.workflows.read().contains_key(&input.workflow_id) {
            return Err(StoreError::WorkflowNotFound(input.workflow_id));
        }
        let record = ExecutionRecord {
            id: Uuid::now_v7(),
            workflow_id: input.workflow_id,
            version: input.version,
            status: ExecutionStatus::Queued,
            trigger_type: input.trigger_type,
            input: input.input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.executions.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if !from.contains(&execution.status) {
            return Ok(false);
        }
        execution.status = to;
        // Leaving a settled state (operator resume) reopens the execution
        if !to.is_terminal() {
            execution.completed_at = None;
        }
        Ok(true)
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.status = status;
        if output.is_some() {
            execution.output = output;
        }
        if error.is_some() {
            execution.error = error;
        }
        if status.is_terminal() {
            execution.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut executions: Vec<_> = self
            .executions
            .read()
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit);
        Ok(executions)
    }

    async fn insert_node_execution(
        &self,
        input: NewNodeExecution,
    ) -> Result<NodeExecutionRecord, StoreError> {
        let record = NodeExecutionRecord {
            id: Uuid::now_v7(),
            execution_id: input.execution_id,
            node_id: input.node_id,
            node_type: input.node_type,
            status: input.status,
            input: input.input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            idempotency_key: input.idempotency_key,
            parent_loop_node_id: input.parent_loop_node_id,
        };
        self.node_executions.write().push(record.clone());
        Ok(record)
    }

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut rows = self.node_executions.write();
        let row = rows
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(StoreError::NodeExecutionNotFound(id))?;
        row.status = NodeExecutionStatus::Success;
        row.output = Some(output.clone());
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut rows = self.node_executions.write();
        let row = rows
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(StoreError::NodeExecutionNotFound(id))?;
        row.status = NodeExecutionStatus::Error;
        row.error = Some(error.to_string());
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        Ok(self
            .node_executions
            .read()
            .iter()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn successful_node_outputs(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        // Insertion order; later successes for the same node win
        let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for row in self.node_executions.read().iter() {
            if row.execution_id == execution_id && row.status == NodeExecutionStatus::Success {
                if !outputs.contains_key(&row.node_id) {
                    order.push(row.node_id.clone());
                }
                outputs.insert(
                    row.node_id.clone(),
                    row.output.clone().unwrap_or(serde_json::Value::Null),
                );
            }
        }
        Ok(order
            .into_iter()
            .map(|id| {
                let output = outputs.remove(&id).unwrap_or(serde_json::Value::Null);
                (id, output)
            })
            .collect())
    }

    async fn enqueue_outbox(
        &self,
        node: NewNodeExecution,
        message: NewOutboxMessage,
    ) -> Result<(Uuid, Uuid), StoreError> {
        let execution_id = node.execution_id;
        let node_record = self.insert_node_execution(node).await?;
        let message_record = OutboxMessageRecord {
            id: Uuid::now_v7(),
            node_execution_id: node_record.id,
            execution_id,
            event_type: message.event_type,
            payload: message.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts: message.max_attempts,
            next_retry_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
            idempotency_key: message.idempotency_key,
            created_at: Utc::now(),
            processed_at: None,
        };
        let message_id = message_record.id;
        self.outbox.write().insert(message_id, message_record);
        Ok((node_record.id, message_id))
    }

    async fn claim_due_outbox(
        &self,
        limit: usize,
    ) -> Result<Vec<ClaimedOutboxMessage>, StoreError> {
        let now = Utc::now();
        let mut outbox = self.outbox.write();
        let mut due: Vec<Uuid> = outbox
            .values()
            .filter(|m| m.status == OutboxStatus::Pending && m.next_retry_at <= now)
            .map(|m| m.id)
            .collect();
        due.sort_by_key(|id| outbox[id].created_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let message = outbox.get_mut(&id).expect("id collected above");
            message.status = OutboxStatus::Processing;
            message.attempts += 1;
            message.last_attempt_at = Some(now);
            claimed.push(ClaimedOutboxMessage {
                id: message.id,
                node_execution_id: message.node_execution_id,
                execution_id: message.execution_id,
                event_type: message.event_type.clone(),
                payload: message.payload.clone(),
                attempts: message.attempts,
                max_attempts: message.max_attempts,
                idempotency_key: message.idempotency_key.clone(),
            });
        }
        Ok(claimed)
    }

    async fn complete_outbox(
        &self,
        message_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let node_execution_id = {
            let mut outbox = self.outbox.write();
            let message = outbox
                .get_mut(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            message.status = OutboxStatus::Completed;
            message.processed_at = Some(Utc::now());
            message.node_execution_id
        };
        self.complete_node_execution(node_execution_id, output).await
    }

    async fn fail_outbox(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<OutboxFailureOutcome, StoreError> {
        let (node_execution_id, dead, attempts, next_retry_at) = {
            let mut outbox = self.outbox.write();
            let message = outbox
                .get_mut(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            message.last_error = Some(error.to_string());
            if message.attempts < message.max_attempts {
                let next = Utc::now() + outbox_backoff(message.attempts);
                message.status = OutboxStatus::Pending;
                message.next_retry_at = next;
                (message.node_execution_id, false, message.attempts, next)
            } else {
                message.status = OutboxStatus::DeadLetter;
                (message.node_execution_id, true, message.attempts, Utc::now())
            }
        };

        if dead {
            self.fail_node_execution(
                node_execution_id,
                &format!("Failed after {attempts} attempts: {error}"),
            )
            .await?;
            Ok(OutboxFailureOutcome::DeadLettered)
        } else {
            Ok(OutboxFailureOutcome::WillRetry { next_retry_at })
        }
    }

    async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), StoreError> {
        let mut outbox = self.outbox.write();
        let message = outbox
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if message.status != OutboxStatus::DeadLetter {
            return Err(StoreError::Conflict(format!(
                "message {message_id} is not dead-lettered"
            )));
        }
        message.status = OutboxStatus::Pending;
        message.attempts = 0;
        message.next_retry_at = Utc::now();
        message.last_error = None;
        Ok(())
    }

    async fn open_outbox_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .outbox
            .read()
            .values()
            .filter(|m| m.execution_id == execution_id && m.status.is_open())
            .count())
    }

    async fn dead_letter_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .outbox
            .read()
            .values()
            .filter(|m| m.execution_id == execution_id && m.status == OutboxStatus::DeadLetter)
            .count())
    }

    async fn schedule_sleep(
        &self,
        node_execution_id: Uuid,
        output: &serde_json::Value,
        schedule: NewSleepSchedule,
    ) -> Result<Uuid, StoreError> {
        {
            let mut executions = self.executions.write();
            let execution = executions
                .get_mut(&schedule.execution_id)
                .ok_or(StoreError::ExecutionNotFound(schedule.execution_id))?;
            if execution.status.is_terminal() {
                return Err(StoreError::Conflict(format!(
                    "execution {} is terminal, cannot sleep",
                    schedule.execution_id
                )));
            }
            execution.status = ExecutionStatus::Sleeping;
        }

        self.complete_node_execution(node_execution_id, output).await?;

        let record = SleepScheduleRecord {
            id: Uuid::now_v7(),
            execution_id: schedule.execution_id,
            workflow_id: schedule.workflow_id,
            node_id: schedule.node_id,
            wake_up_at: schedule.wake_up_at,
            status: SleepStatus::Pending,
            created_at: Utc::now(),
        };
        let id = record.id;
        self.sleeps.write().insert(id, record);
        Ok(id)
    }

    async fn due_sleep_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SleepScheduleRecord>, StoreError> {
        let mut due: Vec<_> = self
            .sleeps
            .read()
            .values()
            .filter(|s| s.status == SleepStatus::Pending && s.wake_up_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.wake_up_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn fire_sleep_schedule(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut sleeps = self.sleeps.write();
        match sleeps.get_mut(&id) {
            Some(s) if s.status == SleepStatus::Pending => {
                s.status = SleepStatus::Fired;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn cancel_sleep_schedules(&self, execution_id: Uuid) -> Result<(), StoreError> {
        for s in self.sleeps.write().values_mut() {
            if s.execution_id == execution_id && s.status == SleepStatus::Pending {
                s.status = SleepStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn pending_sleep_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .sleeps
            .read()
            .values()
            .filter(|s| s.execution_id == execution_id && s.status == SleepStatus::Pending)
            .count())
    }

    async fn enqueue_job(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let state = JobState {
            id: Uuid::now_v7(),
            queue: job.queue,
            workflow_id: job.workflow_id,
            execution_id: job.execution_id,
            input: job.input,
            trigger_type: job.trigger_type,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts: job.max_attempts,
            visible_at: Utc::now(),
            claimed_by: None,
            heartbeat_at: None,
            last_error: None,
        };
        let id = state.id;
        self.jobs.write().insert(id, state);
        Ok(id)
    }

    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let mut claimable: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.queue == queue && j.status == JobStatus::Pending && j.visible_at <= now)
            .map(|j| j.id)
            .collect();
        claimable.sort_by_key(|id| jobs[id].visible_at);
        claimable.truncate(limit);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let job = jobs.get_mut(&id).expect("id collected above");
            job.status = JobStatus::Claimed;
            job.attempt += 1;
            job.claimed_by = Some(worker_id.to_string());
            job.heartbeat_at = Some(now);
            claimed.push(ClaimedJob {
                id: job.id,
                queue: job.queue.clone(),
                workflow_id: job.workflow_id,
                execution_id: job.execution_id,
                input: job.input.clone(),
                trigger_type: job.trigger_type,
                attempt: job.attempt,
                max_attempts: job.max_attempts,
            });
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        job.status = JobStatus::Completed;
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<JobFailureOutcome, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        job.last_error = Some(error.to_string());
        if job.attempt < job.max_attempts {
            let delay = job_backoff(job.attempt);
            job.status = JobStatus::Pending;
            job.claimed_by = None;
            job.visible_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            Ok(JobFailureOutcome::WillRetry {
                next_attempt: job.attempt + 1,
                delay,
            })
        } else {
            job.status = JobStatus::Failed;
            Ok(JobFailureOutcome::Failed)
        }
    }

    async fn heartbeat_job(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Claimed
                    && job.claimed_by.as_deref() == Some(worker_id) =>
            {
                job.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_job_count(&self, execution_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|j| {
                j.execution_id == execution_id
                    && matches!(j.status, JobStatus::Pending | JobStatus::Claimed)
            })
            .count())
    }

    async fn reclaim_stale_jobs(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let mut reclaimed = Vec::new();
        let mut interrupted_executions = Vec::new();
        {
            let mut jobs = self.jobs.write();
            for job in jobs.values_mut() {
                if job.status == JobStatus::Claimed
                    && job.heartbeat_at.is_some_and(|hb| hb < cutoff)
                {
                    job.status = JobStatus::Pending;
                    job.claimed_by = None;
                    job.heartbeat_at = None;
                    reclaimed.push(job.id);
                    interrupted_executions.push(job.execution_id);
                }
            }
        }
        {
            let mut executions = self.executions.write();
            for execution_id in interrupted_executions {
                if let Some(execution) = executions.get_mut(&execution_id) {
                    if execution.status == ExecutionStatus::Running {
                        execution.status = ExecutionStatus::Interrupted;
                    }
                }
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::definition::{EdgeDefinition, NodeDefinition};

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            vec![
                NodeDefinition::new("s", "start"),
                NodeDefinition::new("e", "end"),
            ],
            vec![EdgeDefinition::new("e1", "s", "e")],
        )
    }

    async fn seeded(store: &InMemoryWorkflowStore) -> (Uuid, Uuid) {
        let workflow = store
            .create_workflow(CreateWorkflow::new(Uuid::now_v7(), "test"))
            .await
            .unwrap();
        let version = store
            .create_version(workflow.id, &definition())
            .await
            .unwrap();
        let execution = store
            .create_execution(NewExecution {
                workflow_id: workflow.id,
                version,
                trigger_type: TriggerType::Manual,
                input: serde_json::json!({}),
            })
            .await
            .unwrap();
        (workflow.id, execution.id)
    }

    #[tokio::test]
    async fn test_version_numbers_increase() {
        let store = InMemoryWorkflowStore::new();
        let workflow = store
            .create_workflow(CreateWorkflow::new(Uuid::now_v7(), "wf"))
            .await
            .unwrap();
        assert_eq!(store.create_version(workflow.id, &definition()).await.unwrap(), 1);
        assert_eq!(store.create_version(workflow.id, &definition()).await.unwrap(), 2);
        assert_eq!(
            store.get_workflow(workflow.id).await.unwrap().current_version,
            2
        );
        let v1 = store.get_version(workflow.id, 1).await.unwrap();
        assert_eq!(v1.version, 1);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let store = InMemoryWorkflowStore::new();
        let (_, execution_id) = seeded(&store).await;

        assert!(store
            .complete_execution(execution_id, ExecutionStatus::Success, None, None)
            .await
            .unwrap());
        // Second terminal write is refused
        assert!(!store
            .complete_execution(
                execution_id,
                ExecutionStatus::Error,
                None,
                Some("late".to_string())
            )
            .await
            .unwrap());

        let execution = store.get_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.completed_at.is_some());
        assert!(execution.error.is_none());
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let store = InMemoryWorkflowStore::new();
        let (_, execution_id) = seeded(&store).await;

        assert!(store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Queued],
                ExecutionStatus::Running
            )
            .await
            .unwrap());
        // Same precondition no longer holds
        assert!(!store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Queued],
                ExecutionStatus::Running
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_outbox_enqueue_claim_complete() {
        let store = InMemoryWorkflowStore::new();
        let (_, execution_id) = seeded(&store).await;

        let (node_id, message_id) = store
            .enqueue_outbox(
                NewNodeExecution {
                    execution_id,
                    node_id: "email-1".to_string(),
                    node_type: "email".to_string(),
                    status: NodeExecutionStatus::Pending,
                    input: Some(serde_json::json!({})),
                    idempotency_key: Some("k-1".to_string()),
                    parent_loop_node_id: None,
                },
                NewOutboxMessage {
                    event_type: "email.send".to_string(),
                    payload: serde_json::json!({"to": "a@b.c"}),
                    max_attempts: 3,
                    idempotency_key: "k-1".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(store.open_outbox_count(execution_id).await.unwrap(), 1);

        let claimed = store.claim_due_outbox(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, message_id);
        assert_eq!(claimed[0].attempts, 1);

        // Already claimed; nothing left
        assert!(store.claim_due_outbox(10).await.unwrap().is_empty());

        store
            .complete_outbox(message_id, &serde_json::json!({"sent": true}))
            .await
            .unwrap();
        assert_eq!(store.open_outbox_count(execution_id).await.unwrap(), 0);

        let rows = store.list_node_executions(execution_id).await.unwrap();
        let node = rows.iter().find(|n| n.id == node_id).unwrap();
        assert_eq!(node.status, NodeExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_outbox_retry_then_dead_letter() {
        let store = InMemoryWorkflowStore::new();
        let (_, execution_id) = seeded(&store).await;

        let (node_id, message_id) = store
            .enqueue_outbox(
                NewNodeExecution {
                    execution_id,
                    node_id: "email-1".to_string(),
                    node_type: "email".to_string(),
                    status: NodeExecutionStatus::Pending,
                    input: None,
                    idempotency_key: None,
                    parent_loop_node_id: None,
                },
                NewOutboxMessage {
                    event_type: "email.send".to_string(),
                    payload: serde_json::json!({}),
                    max_attempts: 3,
                    idempotency_key: "k-2".to_string(),
                },
            )
            .await
            .unwrap();

        // Attempts 1 and 2 retry with growing backoff
        for expected_minutes in [1i64, 2] {
            let claimed = store.claim_due_outbox(10).await.unwrap();
            assert_eq!(claimed.len(), 1);
            let before = Utc::now();
            match store.fail_outbox(message_id, "smtp down").await.unwrap() {
                OutboxFailureOutcome::WillRetry { next_retry_at } => {
                    let delta = next_retry_at - before;
                    assert!(delta >= chrono::Duration::minutes(expected_minutes - 1));
                    assert!(delta <= chrono::Duration::minutes(expected_minutes + 1));
                }
                other => panic!("expected retry, got {other:?}"),
            }
            // Not yet due
            assert!(store.claim_due_outbox(10).await.unwrap().is_empty());
            // Make it due again
            store
                .outbox
                .write()
                .get_mut(&message_id)
                .unwrap()
                .next_retry_at = Utc::now();
        }

        // Third failure exhausts attempts
        let claimed = store.claim_due_outbox(10).await.unwrap();
        assert_eq!(claimed[0].attempts, 3);
        match store.fail_outbox(message_id, "smtp down").await.unwrap() {
            OutboxFailureOutcome::DeadLettered => {}
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(store.dead_letter_count(execution_id).await.unwrap(), 1);

        let rows = store.list_node_executions(execution_id).await.unwrap();
        let node = rows.iter().find(|n| n.id == node_id).unwrap();
        assert_eq!(node.status, NodeExecutionStatus::Error);
        assert!(node.error.as_deref().unwrap().contains("Failed after 3 attempts"));

        // Operator retry resets the message
        store.retry_dead_letter(message_id).await.unwrap();
        let claimed = store.claim_due_outbox(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_sleep_schedule_lifecycle() {
        let store = InMemoryWorkflowStore::new();
        let (workflow_id, execution_id) = seeded(&store).await;

        let node = store
            .insert_node_execution(NewNodeExecution::running(
                execution_id,
                "sleep-1",
                "sleep",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let wake = Utc::now() + chrono::Duration::seconds(5);
        let schedule_id = store
            .schedule_sleep(
                node.id,
                &serde_json::json!({"data": true}),
                NewSleepSchedule {
                    execution_id,
                    workflow_id,
                    node_id: "sleep-1".to_string(),
                    wake_up_at: wake,
                },
            )
            .await
            .unwrap();

        let execution = store.get_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Sleeping);
        assert_eq!(store.pending_sleep_count(execution_id).await.unwrap(), 1);

        // Not yet due
        assert!(store
            .due_sleep_schedules(Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
        // Due at wake time
        let due = store
            .due_sleep_schedules(wake + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        assert!(store.fire_sleep_schedule(schedule_id).await.unwrap());
        // CAS: second fire is a no-op
        assert!(!store.fire_sleep_schedule(schedule_id).await.unwrap());
        assert_eq!(store.pending_sleep_count(execution_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_job_claim_and_retry() {
        let store = InMemoryWorkflowStore::new();
        let (workflow_id, execution_id) = seeded(&store).await;

        let job_id = store
            .enqueue_job(NewJob::workflow_run(
                workflow_id,
                execution_id,
                serde_json::json!({}),
                TriggerType::Manual,
            ))
            .await
            .unwrap();

        // Wrong queue claims nothing
        assert!(store.claim_jobs("default", "w-1", 10).await.unwrap().is_empty());

        let claimed = store.claim_jobs("workflow", "w-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
        assert!(store.heartbeat_job(job_id, "w-1").await.unwrap());
        assert!(!store.heartbeat_job(job_id, "w-2").await.unwrap());

        match store.fail_job(job_id, "db down").await.unwrap() {
            JobFailureOutcome::WillRetry { next_attempt, .. } => assert_eq!(next_attempt, 2),
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(store.pending_job_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_job_reclaim_marks_interrupted() {
        let store = InMemoryWorkflowStore::new();
        let (workflow_id, execution_id) = seeded(&store).await;

        store
            .enqueue_job(NewJob::workflow_run(
                workflow_id,
                execution_id,
                serde_json::json!({}),
                TriggerType::Manual,
            ))
            .await
            .unwrap();
        store.claim_jobs("workflow", "w-1", 1).await.unwrap();
        store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Queued],
                ExecutionStatus::Running,
            )
            .await
            .unwrap();

        // Nothing is stale yet
        assert!(store
            .reclaim_stale_jobs(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        let reclaimed = store.reclaim_stale_jobs(Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        let execution = store.get_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Interrupted);
        assert_eq!(store.pending_job_count(), 1);
    }

    #[tokio::test]
    async fn test_successful_outputs_latest_wins() {
        let store = InMemoryWorkflowStore::new();
        let (_, execution_id) = seeded(&store).await;

        let first = store
            .insert_node_execution(NewNodeExecution::running(
                execution_id,
                "n-1",
                "json",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        store
            .complete_node_execution(first.id, &serde_json::json!({"v": 1}))
            .await
            .unwrap();

        let second = store
            .insert_node_execution(NewNodeExecution::running(
                execution_id,
                "n-1",
                "json",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        store
            .complete_node_execution(second.id, &serde_json::json!({"v": 2}))
            .await
            .unwrap();

        let outputs = store.successful_node_outputs(execution_id).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0, "n-1");
        assert_eq!(outputs[0].1, serde_json::json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_delete_workflow_cascades() {
        let store = InMemoryWorkflowStore::new();
        let (workflow_id, execution_id) = seeded(&store).await;
        store
            .insert_node_execution(NewNodeExecution::running(
                execution_id,
                "n-1",
                "json",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        store.delete_workflow(workflow_id).await.unwrap();
        assert!(matches!(
            store.get_execution(execution_id).await,
            Err(StoreError::ExecutionNotFound(_))
        ));
        assert!(store
            .list_node_executions(execution_id)
            .await
            .unwrap()
            .is_empty());
    }
}
