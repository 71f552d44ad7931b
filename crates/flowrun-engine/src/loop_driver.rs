//! Loop driver
//!
//! Drives `loop` and `loop-accumulator` nodes: runs the body subgraph once
//! per element, tags iteration rows with the parent loop id, sleeps the
//! configured delay between iterations, and marks the walked subgraph
//! executed so the outer BFS does not re-run it.
//!
//! The accumulator's feedback edge (body -> accumulator) is never followed;
//! after all iterations only successors on the `output` handle are enqueued.

use std::collections::{HashMap, HashSet, VecDeque};

use flowrun_core::definition::{is_loop_kind, is_marker, NodeDefinition, HANDLE_LOOP_OUTPUT, HANDLE_OUTPUT};
use flowrun_core::value::approx_size;
use flowrun_core::{ExecutionContext, Graph};
use flowrun_nodes::loops::{iteration_items, AccumulationMode, ErrorHandling, LoopConfig};
use flowrun_nodes::Dispatch;
use flowrun_storage::{ExecutionRecord, NewNodeExecution, WorkflowStore};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::runner::{DagRunner, NodeOutcome, WalkState};

/// How the outer BFS continues after a loop node
pub(crate) enum LoopOutcome {
    /// Enqueue these successors; the walked body is already marked executed
    Continue { next: Vec<String> },

    /// The execution was marked error (fail-fast)
    Failed,
}

/// One iteration's walk result
struct IterationResult {
    last_output: Value,
}

/// Business failure inside an iteration
struct IterationFailure {
    node_id: String,
    message: String,
}

impl<S: WorkflowStore> DagRunner<S> {
    pub(crate) async fn drive_loop(
        &self,
        graph: &Graph,
        execution: &ExecutionRecord,
        node: &NodeDefinition,
        input: Value,
        state: &mut WalkState,
        root: &ExecutionContext,
    ) -> Result<LoopOutcome, EngineError> {
        if node.kind == flowrun_core::definition::kinds::LOOP_ACCUMULATOR {
            self.drive_accumulator(graph, execution, node, input, state, root)
                .await
        } else {
            self.drive_plain_loop(graph, execution, node, input, state, root)
                .await
        }
    }

    /// `loop`: every direct successor is a body entry; after the iterations
    /// the entire downstream subgraph is marked executed.
    async fn drive_plain_loop(
        &self,
        graph: &Graph,
        execution: &ExecutionRecord,
        node: &NodeDefinition,
        input: Value,
        state: &mut WalkState,
        root: &ExecutionContext,
    ) -> Result<LoopOutcome, EngineError> {
        let config = match LoopConfig::parse(&node.data.config) {
            Ok(c) => c,
            Err(message) => return self.fail_loop(execution, node, state, None, &message).await,
        };

        // The loop executor derives the iteration list
        let items_outcome = self
            .execute_sync_node(execution, node, &input, state, root, None)
            .await?;
        let loop_output = match items_outcome {
            NodeOutcome::Success(output) => output,
            NodeOutcome::BusinessFailure(message) => {
                let message = format!("node {} failed: {message}", node.id);
                self.store()
                    .complete_execution(
                        execution.id,
                        flowrun_core::ExecutionStatus::Error,
                        None,
                        Some(message),
                    )
                    .await?;
                return Ok(LoopOutcome::Failed);
            }
            NodeOutcome::Sleep => {
                // Loop kinds never sleep; the executor does not return it
                return Err(EngineError::Executor(
                    flowrun_core::ExecutorError::internal("loop executor requested sleep"),
                ));
            }
        };
        let results = loop_output
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        state.last_output = loop_output.clone();
        state.node_outputs.insert(node.id.clone(), loop_output);
        state.executed.insert(node.id.clone());

        let entries: Vec<String> = graph
            .successors(&node.id)
            .iter()
            .map(|e| e.target.clone())
            .collect();

        info!(execution_id = %execution.id, loop_node = %node.id, iterations = results.len(), "driving loop");
        let total = results.len();
        for (index, item) in results.into_iter().enumerate() {
            if let Some(failed) = self
                .check_iteration_limit(execution, node, state, None)
                .await?
            {
                return Ok(failed);
            }

            let walked = self
                .walk_iteration(graph, execution, node, &entries, None, item, state, root)
                .await?;
            if let Err(failure) = walked {
                let message = format!(
                    "iteration {index} failed at node {}: {}",
                    failure.node_id, failure.message
                );
                return self.fail_loop(execution, node, state, None, &message).await;
            }

            if config.iteration_delay_ms > 0 && index + 1 < total {
                tokio::time::sleep(std::time::Duration::from_millis(config.iteration_delay_ms))
                    .await;
            }
        }

        // The outer BFS must not rewalk anything downstream of the loop
        let marked = reachable_from(graph, &entries, None);
        state.executed.extend(marked);

        Ok(LoopOutcome::Continue { next: entries })
    }

    /// `loop-accumulator`: body entries hang off the `loop-output` handle,
    /// the accumulated result exits through `output`.
    async fn drive_accumulator(
        &self,
        graph: &Graph,
        execution: &ExecutionRecord,
        node: &NodeDefinition,
        input: Value,
        state: &mut WalkState,
        root: &ExecutionContext,
    ) -> Result<LoopOutcome, EngineError> {
        // Accumulator row is created up front and completed after the loop
        let row = self
            .store()
            .insert_node_execution(NewNodeExecution::running(
                execution.id,
                node.id.clone(),
                node.kind.clone(),
                input.clone(),
            ))
            .await?;

        let config = match LoopConfig::parse(&node.data.config) {
            Ok(c) => c,
            Err(message) => {
                return self
                    .fail_loop(execution, node, state, Some(row.id), &message)
                    .await
            }
        };
        let items = match iteration_items(&input) {
            Ok(items) => items,
            Err(message) => {
                return self
                    .fail_loop(execution, node, state, Some(row.id), &message)
                    .await
            }
        };

        let entries: Vec<String> = graph
            .successors(&node.id)
            .iter()
            .filter(|e| e.source_handle.as_deref() == Some(HANDLE_LOOP_OUTPUT))
            .map(|e| e.target.clone())
            .collect();
        let next: Vec<String> = graph
            .successors(&node.id)
            .iter()
            .filter(|e| e.source_handle.as_deref() == Some(HANDLE_OUTPUT))
            .map(|e| e.target.clone())
            .collect();

        info!(
            execution_id = %execution.id,
            accumulator = %node.id,
            iterations = items.len(),
            mode = ?config.mode,
            "driving loop accumulator"
        );

        let mut accumulated = config.empty_accumulator();
        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            if let Some(failed) = self
                .check_iteration_limit(execution, node, state, Some(row.id))
                .await?
            {
                return Ok(failed);
            }

            let iteration_input = json!({ "index": index, "item": item });
            let walked = self
                .walk_iteration(
                    graph,
                    execution,
                    node,
                    &entries,
                    Some(node.id.as_str()),
                    iteration_input,
                    state,
                    root,
                )
                .await?;

            match walked {
                Ok(result) => {
                    match config.mode {
                        AccumulationMode::Array => {
                            if let Value::Array(items) = &mut accumulated {
                                items.push(result.last_output);
                            }
                        }
                        AccumulationMode::Last => {
                            if !result.last_output.is_null() {
                                accumulated = result.last_output;
                            }
                        }
                    }
                    if approx_size(&accumulated) > self.limits().max_accumulator_bytes {
                        let message = self.limits().accumulator_size_message();
                        return self
                            .fail_loop(execution, node, state, Some(row.id), &message)
                            .await;
                    }
                }
                Err(failure) => match config.error_handling {
                    ErrorHandling::Skip => {
                        debug!(
                            execution_id = %execution.id,
                            iteration = index,
                            node_id = %failure.node_id,
                            "iteration dropped (errorHandling=skip)"
                        );
                    }
                    ErrorHandling::Fail => {
                        let message = format!(
                            "iteration {index} failed at node {}: {}",
                            failure.node_id, failure.message
                        );
                        return self
                            .fail_loop(execution, node, state, Some(row.id), &message)
                            .await;
                    }
                },
            }

            if config.iteration_delay_ms > 0 && index + 1 < total {
                tokio::time::sleep(std::time::Duration::from_millis(config.iteration_delay_ms))
                    .await;
            }
        }

        let mut output_map = serde_json::Map::new();
        output_map.insert("iteration_count".to_string(), json!(total));
        output_map.insert(config.accumulator_variable.clone(), accumulated);
        let output = Value::Object(output_map);
        self.store().complete_node_execution(row.id, &output).await?;

        state.last_output = output.clone();
        state.node_outputs.insert(node.id.clone(), output);
        state.executed.insert(node.id.clone());

        // Mark the body executed, stopping at the accumulator so the
        // output-handle successors stay eligible
        let marked = reachable_from(graph, &entries, Some(node.id.as_str()));
        state.executed.extend(marked);

        Ok(LoopOutcome::Continue { next })
    }

    /// Enforce the shared iteration cap. Returns the failure outcome when
    /// the limit is hit.
    async fn check_iteration_limit(
        &self,
        execution: &ExecutionRecord,
        node: &NodeDefinition,
        state: &mut WalkState,
        row_id: Option<uuid::Uuid>,
    ) -> Result<Option<LoopOutcome>, EngineError> {
        state.iterations_run += 1;
        if state.iterations_run > self.limits().max_loop_iterations {
            let message = self.limits().iterations_message();
            let outcome = self
                .fail_loop(execution, node, state, row_id, &message)
                .await?;
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    /// Walk one iteration of the body subgraph.
    ///
    /// Identical to the main BFS except it skips markers and nested loop
    /// kinds, tags rows with the parent loop id, and never follows edges
    /// targeting `stop_at` (the accumulator feedback edge).
    #[allow(clippy::too_many_arguments)]
    async fn walk_iteration(
        &self,
        graph: &Graph,
        execution: &ExecutionRecord,
        loop_node: &NodeDefinition,
        entries: &[String],
        stop_at: Option<&str>,
        iteration_input: Value,
        state: &mut WalkState,
        root: &ExecutionContext,
    ) -> Result<Result<IterationResult, IterationFailure>, EngineError> {
        let mut local_outputs: HashMap<String, Value> = HashMap::new();
        let mut last_output = Value::Null;

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        for entry in entries {
            if Some(entry.as_str()) != stop_at && visited.insert(entry.clone()) {
                queue.push_back(entry.clone());
            }
        }

        while let Some(node_id) = queue.pop_front() {
            let Some(node) = graph.node(&node_id) else {
                continue;
            };

            // Nested loop kinds are not executed inside a body walk
            if is_loop_kind(&node.kind) {
                continue;
            }

            if !is_marker(&node.kind) {
                state.nodes_run += 1;
                if state.nodes_run > self.limits().max_nodes {
                    return Ok(Err(IterationFailure {
                        node_id: node_id.clone(),
                        message: self.limits().node_count_message(),
                    }));
                }

                let input = graph
                    .predecessors(&node_id)
                    .iter()
                    .find_map(|edge| local_outputs.get(&edge.source).cloned())
                    .unwrap_or_else(|| iteration_input.clone());

                let config = node.data.config.clone();
                match self.registry().dispatch(&node.kind, &config) {
                    Dispatch::Outbox { event_type } => {
                        self.enqueue_deferred(
                            execution,
                            node,
                            &input,
                            state,
                            event_type,
                            Some(&loop_node.id),
                        )
                        .await?;
                        let placeholder = json!({ "status": "queued", "nodeId": node.id });
                        local_outputs.insert(node_id.clone(), placeholder.clone());
                        last_output = placeholder;
                    }
                    Dispatch::Sync => {
                        let outcome = self
                            .execute_sync_node(
                                execution,
                                node,
                                &input,
                                state,
                                root,
                                Some(&loop_node.id),
                            )
                            .await?;
                        match outcome {
                            NodeOutcome::Success(output) => {
                                local_outputs.insert(node_id.clone(), output.clone());
                                last_output = output;
                            }
                            NodeOutcome::BusinessFailure(message) => {
                                return Ok(Err(IterationFailure {
                                    node_id: node_id.clone(),
                                    message,
                                }));
                            }
                            NodeOutcome::Sleep => {
                                return Ok(Err(IterationFailure {
                                    node_id: node_id.clone(),
                                    message: "durable sleep is not supported inside loop iterations"
                                        .to_string(),
                                }));
                            }
                        }
                    }
                }
            }

            for edge in graph.successors(&node_id) {
                if Some(edge.target.as_str()) == stop_at {
                    continue;
                }
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }

        Ok(Ok(IterationResult { last_output }))
    }

    /// Fail the loop node row (when it exists) and the execution.
    async fn fail_loop(
        &self,
        execution: &ExecutionRecord,
        node: &NodeDefinition,
        _state: &mut WalkState,
        row_id: Option<uuid::Uuid>,
        message: &str,
    ) -> Result<LoopOutcome, EngineError> {
        if let Some(row_id) = row_id {
            self.store().fail_node_execution(row_id, message).await?;
        }
        self.store()
            .complete_execution(
                execution.id,
                flowrun_core::ExecutionStatus::Error,
                None,
                Some(format!("node {} failed: {message}", node.id)),
            )
            .await?;
        Ok(LoopOutcome::Failed)
    }
}

/// All nodes reachable from `entries`, never traversing into `stop_at`.
fn reachable_from(graph: &Graph, entries: &[String], stop_at: Option<&str>) -> HashSet<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for entry in entries {
        if Some(entry.as_str()) != stop_at && seen.insert(entry.clone()) {
            queue.push_back(entry.clone());
        }
    }
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.successors(&node_id) {
            if Some(edge.target.as_str()) == stop_at {
                continue;
            }
            if seen.insert(edge.target.clone()) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    seen
}
