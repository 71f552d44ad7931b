//! Trigger adapters
//!
//! Four trigger kinds create or requeue executions: manual, scheduled,
//! webhook, and resume. Validation (definition shape, node configs, cron)
//! happens here, at trigger time, never mid-execution.

use std::sync::Arc;

use flowrun_core::definition::is_marker;
use flowrun_core::{ExecutionStatus, Graph, TriggerType, ValidationError, WorkflowDefinition};
use flowrun_nodes::ExecutorRegistry;
use flowrun_storage::{NewExecution, NewJob, StoreError, WorkflowStore};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Maximum webhook payload size (10 MiB)
pub const MAX_WEBHOOK_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Errors from trigger operations
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Definition or config rejected
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Uniform webhook failure; never reveals whether the workflow exists
    #[error("unauthorized")]
    Unauthorized,

    /// Webhook payload over the documented limit
    #[error("payload too large: {size} bytes, maximum {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Operation not legal from the execution's current status
    #[error("execution {execution_id} is {status}, {operation} is not legal")]
    IllegalState {
        execution_id: Uuid,
        status: ExecutionStatus,
        operation: &'static str,
    },
}

/// Trigger service: the engine-side contract consumed by the API layer
pub struct TriggerService<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
}

impl<S: WorkflowStore> TriggerService<S> {
    pub fn new(store: Arc<S>, registry: Arc<ExecutorRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create an execution on the workflow's current version and enqueue a
    /// runner job. Returns `(job_id, execution_id)`.
    #[instrument(skip(self, input))]
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        input: Value,
        trigger_type: TriggerType,
    ) -> Result<(Uuid, Uuid), TriggerError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.current_version == 0 {
            return Err(ValidationError::MissingStart.into());
        }
        let version = self
            .store
            .get_version(workflow_id, workflow.current_version)
            .await?;
        self.validate_definition(&version.definition)?;

        let execution = self
            .store
            .create_execution(NewExecution {
                workflow_id,
                version: workflow.current_version,
                trigger_type,
                input: input.clone(),
            })
            .await?;

        let job_id = self
            .store
            .enqueue_job(NewJob::workflow_run(
                workflow_id,
                execution.id,
                input,
                trigger_type,
            ))
            .await?;

        info!(%workflow_id, execution_id = %execution.id, %trigger_type, "execution triggered");
        Ok((job_id, execution.id))
    }

    /// Requeue an existing execution from a resumable state. Does NOT create
    /// a new execution row; the checkpoint walk skips completed nodes.
    #[instrument(skip(self))]
    pub async fn resume_workflow(&self, execution_id: Uuid) -> Result<Uuid, TriggerError> {
        let execution = self.store.get_execution(execution_id).await?;

        match execution.status {
            ExecutionStatus::Error
            | ExecutionStatus::PartiallyFailed
            | ExecutionStatus::Interrupted => {
                let moved = self
                    .store
                    .transition_execution(
                        execution_id,
                        &[
                            ExecutionStatus::Error,
                            ExecutionStatus::PartiallyFailed,
                            ExecutionStatus::Interrupted,
                        ],
                        ExecutionStatus::Queued,
                    )
                    .await?;
                if !moved {
                    return Err(self.illegal(execution_id, "resume").await);
                }
            }
            ExecutionStatus::Sleeping => {
                // Only an overdue sleeper may be resumed by the operator
                let due = self
                    .store
                    .due_sleep_schedules(chrono::Utc::now(), 1_000)
                    .await?
                    .into_iter()
                    .find(|s| s.execution_id == execution_id);
                let Some(schedule) = due else {
                    return Err(self.illegal(execution_id, "resume").await);
                };
                self.store.fire_sleep_schedule(schedule.id).await?;
                self.store
                    .transition_execution(
                        execution_id,
                        &[ExecutionStatus::Sleeping],
                        ExecutionStatus::Queued,
                    )
                    .await?;
            }
            _ => return Err(self.illegal(execution_id, "resume").await),
        }

        let job_id = self
            .store
            .enqueue_job(NewJob::workflow_run(
                execution.workflow_id,
                execution_id,
                execution.input,
                TriggerType::Resume,
            ))
            .await?;

        info!(%execution_id, "execution resumed");
        Ok(job_id)
    }

    /// Cancel a queued or running execution. The runner observes the status
    /// cooperatively and stops at the next node boundary.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), TriggerError> {
        let execution = self.store.get_execution(execution_id).await?;
        if !matches!(
            execution.status,
            ExecutionStatus::Queued | ExecutionStatus::Running
        ) {
            return Err(TriggerError::IllegalState {
                execution_id,
                status: execution.status,
                operation: "cancel",
            });
        }

        self.store
            .complete_execution(execution_id, ExecutionStatus::Cancelled, None, None)
            .await?;
        self.store.cancel_sleep_schedules(execution_id).await?;
        info!(%execution_id, "execution cancelled");
        Ok(())
    }

    /// Webhook trigger: bearer-token authentication against the workflow's
    /// secret hash. Any authentication-related failure is the same uniform
    /// error to prevent enumeration.
    #[instrument(skip(self, bearer_secret, payload))]
    pub async fn trigger_webhook(
        &self,
        workflow_id: Uuid,
        path: Option<&str>,
        bearer_secret: &str,
        payload: Value,
    ) -> Result<(Uuid, Uuid), TriggerError> {
        let size = serde_json::to_string(&payload).map(|s| s.len()).unwrap_or(0);
        if size > MAX_WEBHOOK_PAYLOAD_BYTES {
            return Err(TriggerError::PayloadTooLarge {
                size,
                max: MAX_WEBHOOK_PAYLOAD_BYTES,
            });
        }

        let workflow = match self.store.get_workflow(workflow_id).await {
            Ok(workflow) => workflow,
            Err(StoreError::WorkflowNotFound(_)) => {
                debug!(%workflow_id, "webhook for unknown workflow");
                return Err(TriggerError::Unauthorized);
            }
            Err(err) => return Err(err.into()),
        };

        if !workflow.is_active {
            return Err(TriggerError::Unauthorized);
        }
        if workflow.webhook_path.as_deref() != path {
            return Err(TriggerError::Unauthorized);
        }
        let Some(hash) = workflow.webhook_secret_hash.as_deref() else {
            return Err(TriggerError::Unauthorized);
        };
        let verified = bcrypt::verify(bearer_secret, hash).unwrap_or(false);
        if !verified {
            warn!(%workflow_id, "webhook authentication failed");
            return Err(TriggerError::Unauthorized);
        }

        self.execute_workflow(workflow_id, payload, TriggerType::Webhook)
            .await
    }

    /// Structural + per-node config validation, surfaced at trigger time.
    fn validate_definition(&self, definition_json: &Value) -> Result<(), TriggerError> {
        let definition: WorkflowDefinition = serde_json::from_value(definition_json.clone())
            .map_err(|e| {
                TriggerError::Validation(ValidationError::InvalidNodeConfig {
                    kind: "definition".to_string(),
                    node_id: String::new(),
                    message: e.to_string(),
                })
            })?;
        let graph = Graph::load(&definition)?;
        graph.validate_kinds(|kind| self.registry.is_known(kind))?;

        for node_id in graph.node_ids() {
            let node = graph.node(node_id).expect("id from graph");
            if is_marker(&node.kind) {
                continue;
            }
            let executor = self
                .registry
                .get(&node.kind)
                .map_err(|_| ValidationError::UnknownNodeKind(node.kind.clone()))?;
            executor.validate_config(&node.data.config).map_err(|message| {
                ValidationError::InvalidNodeConfig {
                    kind: node.kind.clone(),
                    node_id: node.id.clone(),
                    message,
                }
            })?;
        }
        Ok(())
    }

    async fn illegal(&self, execution_id: Uuid, operation: &'static str) -> TriggerError {
        match self.store.get_execution(execution_id).await {
            Ok(execution) => TriggerError::IllegalState {
                execution_id,
                status: execution.status,
                operation,
            },
            Err(err) => err.into(),
        }
    }
}
