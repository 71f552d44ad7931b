//! DAG runner
//!
//! Drives one execution from its current checkpoint to completion or to a
//! suspension point. A runner worker suspends at exactly three places:
//! completion, a durable sleep handoff, and fail-fast on error.
//!
//! Checkpoint semantics: successful node execution rows are the checkpoint.
//! On resume the runner reloads their outputs, skips those nodes, retries
//! failed rows, and treats pending rows (whose outbox messages are alive) as
//! in progress.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use flowrun_core::definition::{is_loop_kind, is_marker};
use flowrun_core::value::approx_size;
use flowrun_core::{
    ExecutionContext, ExecutionLimits, ExecutionStatus, Graph, NodeExecutionStatus,
    WorkflowDefinition,
};
use flowrun_nodes::{Dispatch, ExecutorRegistry};
use flowrun_storage::{
    ExecutionRecord, NewNodeExecution, NewOutboxMessage, WorkflowStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;

/// Default outbox delivery attempts
pub const OUTBOX_MAX_ATTEMPTS: i32 = 3;

/// Result of one runner pass over an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A terminal status was set by this pass
    Completed(ExecutionStatus),

    /// Suspended on a durable sleep; the scheduler will requeue it
    Sleeping,

    /// Traversal finished but outbox messages are still open; the execution
    /// stays running until the outbox worker finalizes it
    AwaitingOutbox,

    /// Nothing to do (already terminal, or not in a runnable state)
    NoOp,
}

/// Payload stored on an outbox message: everything the outbox worker needs
/// to rebuild the executor context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxPayload {
    pub account_id: Uuid,
    pub node_id: String,
    pub node_config: Value,
    pub input: Value,
    pub workflow_data: Value,
}

/// Mutable traversal state shared with the loop driver
pub(crate) struct WalkState {
    pub account_id: Uuid,
    pub node_outputs: HashMap<String, Value>,
    pub executed: HashSet<String>,
    pub nodes_run: usize,
    pub iterations_run: usize,
    pub started: Instant,
    pub last_output: Value,
}

impl WalkState {
    fn new(account_id: Uuid) -> Self {
        Self {
            account_id,
            node_outputs: HashMap::new(),
            executed: HashSet::new(),
            nodes_run: 0,
            iterations_run: 0,
            started: Instant::now(),
            last_output: Value::Null,
        }
    }

    /// `{ nodeOutputs, input }` visible to executors
    pub fn workflow_data(&self, workflow_input: &Value) -> Value {
        let outputs: serde_json::Map<String, Value> = self
            .node_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        json!({ "nodeOutputs": outputs, "input": workflow_input })
    }
}

/// Outcome of one synchronous node attempt, after persistence
pub(crate) enum NodeOutcome {
    Success(Value),
    BusinessFailure(String),
    Sleep,
}

/// The DAG runner
pub struct DagRunner<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    limits: ExecutionLimits,
}

impl<S: WorkflowStore> DagRunner<S> {
    pub fn new(store: Arc<S>, registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            store,
            registry,
            limits: ExecutionLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub(crate) fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub(crate) fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Drive one execution from its checkpoint.
    ///
    /// Idempotent: re-delivery for a terminal execution is a no-op, and
    /// already-successful nodes are never re-executed.
    #[instrument(skip(self))]
    pub async fn run(&self, execution_id: Uuid) -> Result<RunOutcome, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(%execution_id, status = %execution.status, "execution already terminal");
            return Ok(RunOutcome::NoOp);
        }

        // Claim the execution; a sleeping execution is only runnable after
        // the scheduler moved it back to queued.
        let claimed = self
            .store
            .transition_execution(
                execution_id,
                &[
                    ExecutionStatus::Queued,
                    ExecutionStatus::Running,
                    ExecutionStatus::Interrupted,
                ],
                ExecutionStatus::Running,
            )
            .await?;
        if !claimed {
            debug!(%execution_id, "execution not in a runnable state");
            return Ok(RunOutcome::NoOp);
        }

        match self.traverse(&execution).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Engine errors mark the execution and still bubble to the
                // queue; re-delivery finds the terminal row and no-ops.
                warn!(%execution_id, error = %err, "engine error during traversal");
                self.store
                    .complete_execution(
                        execution_id,
                        ExecutionStatus::Error,
                        None,
                        Some(err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn traverse(&self, execution: &ExecutionRecord) -> Result<RunOutcome, EngineError> {
        let workflow = self.store.get_workflow(execution.workflow_id).await?;
        let version = self
            .store
            .get_version(execution.workflow_id, execution.version)
            .await?;
        let definition: WorkflowDefinition = serde_json::from_value(version.definition)?;
        let graph = Graph::load(&definition)?;
        graph.validate_kinds(|kind| self.registry.is_known(kind))?;

        let mut state = WalkState::new(workflow.account_id);

        // Rebuild the checkpoint from successful rows
        for (node_id, output) in self
            .store
            .successful_node_outputs(execution.id)
            .await?
        {
            state.node_outputs.insert(node_id.clone(), output);
            state.executed.insert(node_id);
        }
        // Pending rows have live outbox messages; they are in progress
        for row in self.store.list_node_executions(execution.id).await? {
            if row.status == NodeExecutionStatus::Pending {
                state
                    .node_outputs
                    .entry(row.node_id.clone())
                    .or_insert_with(|| json!({ "status": "queued", "nodeId": row.node_id }));
                state.executed.insert(row.node_id);
            }
        }
        let resumed_nodes = state.executed.len();
        if resumed_nodes > 0 {
            info!(execution_id = %execution.id, resumed_nodes, "resuming from checkpoint");
        }

        // Root context: one shared cancellation flag per execution
        let root = ExecutionContext::new(
            execution.id,
            workflow.account_id,
            "",
            Value::Null,
            Value::Null,
            Value::Null,
        );

        let start = graph.start();
        state
            .node_outputs
            .insert(start.id.clone(), execution.input.clone());
        state.executed.insert(start.id.clone());

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.id.clone());
        for edge in graph.successors(&start.id) {
            if visited.insert(edge.target.clone()) {
                queue.push_back(edge.target.clone());
            }
        }

        while let Some(node_id) = queue.pop_front() {
            if state.started.elapsed() > self.limits.execution_timeout {
                let message = format!(
                    "execution timeout exceeded after {} seconds",
                    self.limits.execution_timeout.as_secs()
                );
                return self.fail_execution(execution.id, &message).await;
            }

            // Cooperative cancellation: stop when an operator cancelled us
            let current = self.store.get_execution(execution.id).await?;
            if current.status == ExecutionStatus::Cancelled {
                info!(execution_id = %execution.id, "execution cancelled, stopping traversal");
                return Ok(RunOutcome::Completed(ExecutionStatus::Cancelled));
            }

            let Some(node) = graph.node(&node_id) else {
                continue;
            };

            if is_marker(&node.kind) || state.executed.contains(&node_id) {
                for edge in graph.successors(&node_id) {
                    if visited.insert(edge.target.clone()) {
                        queue.push_back(edge.target.clone());
                    }
                }
                continue;
            }

            state.nodes_run += 1;
            if state.nodes_run > self.limits.max_nodes {
                let message = self.limits.node_count_message();
                return self.fail_execution(execution.id, &message).await;
            }

            let input = resolve_input(&graph, &state, execution, &node_id);

            if is_loop_kind(&node.kind) {
                match self
                    .drive_loop(&graph, execution, node, input, &mut state, &root)
                    .await?
                {
                    crate::loop_driver::LoopOutcome::Continue { next } => {
                        for target in next {
                            if visited.insert(target.clone()) {
                                queue.push_back(target);
                            }
                        }
                    }
                    crate::loop_driver::LoopOutcome::Failed => {
                        return Ok(RunOutcome::Completed(ExecutionStatus::Error));
                    }
                }
                continue;
            }

            let config = node.data.config.clone();
            match self.registry.dispatch(&node.kind, &config) {
                Dispatch::Outbox { event_type } => {
                    self.enqueue_deferred(execution, node, &input, &mut state, event_type, None)
                        .await?;
                }
                Dispatch::Sync => {
                    let outcome = self
                        .execute_sync_node(execution, node, &input, &mut state, &root, None)
                        .await?;
                    match outcome {
                        NodeOutcome::Success(output) => {
                            state.last_output = output.clone();
                            state.node_outputs.insert(node_id.clone(), output);
                            state.executed.insert(node_id.clone());
                        }
                        NodeOutcome::BusinessFailure(message) => {
                            let message = format!("node {node_id} failed: {message}");
                            return self.fail_execution(execution.id, &message).await;
                        }
                        NodeOutcome::Sleep => {
                            info!(execution_id = %execution.id, node_id = %node_id, "execution sleeping");
                            return Ok(RunOutcome::Sleeping);
                        }
                    }
                }
            }

            for edge in graph.successors(&node_id) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }

        self.finalize_traversal(execution, &state).await
    }

    /// Completion check after the queue empties: still-open outbox messages
    /// keep the execution running; dead letters make it partially failed.
    async fn finalize_traversal(
        &self,
        execution: &ExecutionRecord,
        state: &WalkState,
    ) -> Result<RunOutcome, EngineError> {
        let open = self.store.open_outbox_count(execution.id).await?;
        if open > 0 {
            debug!(execution_id = %execution.id, open, "traversal complete, awaiting outbox");
            return Ok(RunOutcome::AwaitingOutbox);
        }

        let dead = self.store.dead_letter_count(execution.id).await?;
        if dead > 0 {
            self.store
                .complete_execution(
                    execution.id,
                    ExecutionStatus::PartiallyFailed,
                    None,
                    Some(format!("{dead} deferred side effect(s) exhausted retries")),
                )
                .await?;
            return Ok(RunOutcome::Completed(ExecutionStatus::PartiallyFailed));
        }

        let changed = self
            .store
            .complete_execution(
                execution.id,
                ExecutionStatus::Success,
                Some(state.last_output.clone()),
                None,
            )
            .await?;
        if changed {
            info!(execution_id = %execution.id, "execution succeeded");
        }
        Ok(RunOutcome::Completed(ExecutionStatus::Success))
    }

    /// Queue an outbox-deferred node: pending node row + outbox message in
    /// one transaction, placeholder output for downstream traversal.
    pub(crate) async fn enqueue_deferred(
        &self,
        execution: &ExecutionRecord,
        node: &flowrun_core::definition::NodeDefinition,
        input: &Value,
        state: &mut WalkState,
        event_type: &'static str,
        parent_loop_node_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let idempotency_key = format!("{}:{}:{}", execution.id, node.id, Uuid::new_v4());
        let payload = OutboxPayload {
            account_id: state.account_id,
            node_id: node.id.clone(),
            node_config: node.data.config.clone(),
            input: input.clone(),
            workflow_data: state.workflow_data(&execution.input),
        };

        self.store
            .enqueue_outbox(
                NewNodeExecution {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    node_type: node.kind.clone(),
                    status: NodeExecutionStatus::Pending,
                    input: Some(input.clone()),
                    idempotency_key: Some(idempotency_key.clone()),
                    parent_loop_node_id: parent_loop_node_id.map(String::from),
                },
                NewOutboxMessage {
                    event_type: event_type.to_string(),
                    payload: serde_json::to_value(&payload)?,
                    max_attempts: OUTBOX_MAX_ATTEMPTS,
                    idempotency_key,
                },
            )
            .await?;

        debug!(execution_id = %execution.id, node_id = %node.id, event_type, "deferred node to outbox");
        let placeholder = json!({ "status": "queued", "nodeId": node.id });
        state.node_outputs.insert(node.id.clone(), placeholder);
        state.executed.insert(node.id.clone());
        Ok(())
    }

    /// Run one synchronous node attempt and persist its row.
    ///
    /// Business failures and sleep handoffs come back as [`NodeOutcome`];
    /// engine errors propagate after the row is marked.
    pub(crate) async fn execute_sync_node(
        &self,
        execution: &ExecutionRecord,
        node: &flowrun_core::definition::NodeDefinition,
        input: &Value,
        state: &mut WalkState,
        root: &ExecutionContext,
        parent_loop_node_id: Option<&str>,
    ) -> Result<NodeOutcome, EngineError> {
        let executor = self.registry.get(&node.kind)?;

        let mut new_row = NewNodeExecution::running(
            execution.id,
            node.id.clone(),
            node.kind.clone(),
            input.clone(),
        );
        if let Some(parent) = parent_loop_node_id {
            new_row = new_row.with_parent_loop(parent);
        }
        let row = self.store.insert_node_execution(new_row).await?;

        let ctx = ExecutionContext::new(
            execution.id,
            state.account_id,
            node.id.clone(),
            node.data.config.clone(),
            input.clone(),
            state.workflow_data(&execution.input),
        )
        .with_cancellation_of(root);

        let attempt = tokio::time::timeout(self.limits.node_timeout, executor.execute(&ctx)).await;

        let result = match attempt {
            Err(_elapsed) => {
                let message = self.limits.node_timeout_message(&node.id);
                self.store.fail_node_execution(row.id, &message).await?;
                return Ok(NodeOutcome::BusinessFailure(message));
            }
            Ok(Err(err)) => {
                self.store
                    .fail_node_execution(row.id, &err.to_string())
                    .await?;
                return Err(err.into());
            }
            Ok(Ok(result)) => result,
        };

        if !result.success {
            let message = result
                .error
                .unwrap_or_else(|| "node returned failure without a message".to_string());
            self.store.fail_node_execution(row.id, &message).await?;
            return Ok(NodeOutcome::BusinessFailure(message));
        }

        if approx_size(&result.output) > self.limits.max_data_bytes {
            let message = self
                .limits
                .data_size_message(approx_size(&result.output));
            self.store.fail_node_execution(row.id, &message).await?;
            return Ok(NodeOutcome::BusinessFailure(message));
        }

        if result.needs_sleep {
            let Some(wake_up_at) = result.wake_up_at else {
                self.store
                    .fail_node_execution(row.id, "needs_sleep without wake_up_at")
                    .await?;
                return Err(EngineError::Executor(
                    flowrun_core::ExecutorError::internal("needs_sleep without wake_up_at"),
                ));
            };
            self.store
                .schedule_sleep(
                    row.id,
                    &result.output,
                    flowrun_storage::NewSleepSchedule {
                        execution_id: execution.id,
                        workflow_id: execution.workflow_id,
                        node_id: node.id.clone(),
                        wake_up_at,
                    },
                )
                .await?;
            return Ok(NodeOutcome::Sleep);
        }

        self.store
            .complete_node_execution(row.id, &result.output)
            .await?;
        Ok(NodeOutcome::Success(result.output))
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        message: &str,
    ) -> Result<RunOutcome, EngineError> {
        self.store
            .complete_execution(
                execution_id,
                ExecutionStatus::Error,
                None,
                Some(message.to_string()),
            )
            .await?;
        Ok(RunOutcome::Completed(ExecutionStatus::Error))
    }
}

/// Resolve a node's input: output of the first predecessor (edge order) with
/// a recorded output, defaulting to the workflow input. Join semantics across
/// multiple predecessors are undefined; graphs needing them use explicit
/// aggregator nodes.
pub(crate) fn resolve_input(
    graph: &Graph,
    state: &WalkState,
    execution: &ExecutionRecord,
    node_id: &str,
) -> Value {
    for edge in graph.predecessors(node_id) {
        if let Some(output) = state.node_outputs.get(&edge.source) {
            return output.clone();
        }
    }
    execution.input.clone()
}

/// Finalize an execution whose traversal already finished, once its last
/// outbox message resolves. Called by the outbox worker and the job pool;
/// refuses while a job is still actively driving the execution.
pub async fn try_finalize<S: WorkflowStore>(
    store: &S,
    execution_id: Uuid,
) -> Result<bool, EngineError> {
    let execution = store.get_execution(execution_id).await?;
    if execution.status != ExecutionStatus::Running {
        return Ok(false);
    }
    if store.active_job_count(execution_id).await? > 0 {
        return Ok(false);
    }
    if store.open_outbox_count(execution_id).await? > 0 {
        return Ok(false);
    }

    let dead = store.dead_letter_count(execution_id).await?;
    let changed = if dead > 0 {
        store
            .complete_execution(
                execution_id,
                ExecutionStatus::PartiallyFailed,
                None,
                Some(format!("{dead} deferred side effect(s) exhausted retries")),
            )
            .await?
    } else {
        store
            .complete_execution(execution_id, ExecutionStatus::Success, None, None)
            .await?
    };
    if changed {
        info!(%execution_id, dead_letters = dead, "finalized execution after outbox drain");
    }
    Ok(changed)
}
