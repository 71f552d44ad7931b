//! Outbox worker
//!
//! Drains deferred side effects: claims due messages (compare-and-set, safe
//! against multiple workers), rebuilds the executor context from the payload,
//! and completes or retries with exponential backoff, dead-lettering after
//! max attempts. Completing the last open message finalizes the owning
//! execution.

use std::sync::Arc;
use std::time::Duration;

use flowrun_core::ExecutionContext;
use flowrun_nodes::ExecutorRegistry;
use flowrun_storage::{ClaimedOutboxMessage, OutboxFailureOutcome, WorkflowStore};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::runner::{try_finalize, OutboxPayload};

/// Outbox worker configuration
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// How often to poll for due messages
    pub poll_interval: Duration,

    /// Messages claimed per poll
    pub batch_size: usize,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
        }
    }
}

impl OutboxWorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Background worker draining the outbox
pub struct OutboxWorker<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    config: OutboxWorkerConfig,
}

impl<S: WorkflowStore> OutboxWorker<S> {
    pub fn new(store: Arc<S>, registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            store,
            registry,
            config: OutboxWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OutboxWorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Poll loop; returns when shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = self.config.poll_interval.as_millis() as u64, "outbox worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain_once().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "processed outbox messages"),
                Err(err) => warn!(error = %err, "outbox drain failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("outbox worker stopped");
    }

    /// Claim and process one batch of due messages. Returns how many were
    /// processed.
    pub async fn drain_once(&self) -> Result<usize, EngineError> {
        let claimed = self
            .store
            .claim_due_outbox(self.config.batch_size)
            .await?;
        let count = claimed.len();
        for message in claimed {
            self.process(message).await?;
        }
        Ok(count)
    }

    /// Process one claimed message: run the executor for its event type and
    /// settle the message. The companion node execution row moves in the same
    /// store transaction.
    #[instrument(skip(self, message), fields(message_id = %message.id, event_type = %message.event_type))]
    async fn process(&self, message: ClaimedOutboxMessage) -> Result<(), EngineError> {
        let execution_id = message.execution_id;

        let settled_final = match self.attempt(&message).await {
            Ok(output) => {
                self.store.complete_outbox(message.id, &output).await?;
                debug!(attempts = message.attempts, "outbox message completed");
                true
            }
            Err(error_message) => {
                match self.store.fail_outbox(message.id, &error_message).await? {
                    OutboxFailureOutcome::WillRetry { next_retry_at } => {
                        debug!(
                            attempts = message.attempts,
                            %next_retry_at,
                            error = %error_message,
                            "outbox message will retry"
                        );
                        false
                    }
                    OutboxFailureOutcome::DeadLettered => {
                        warn!(
                            attempts = message.attempts,
                            error = %error_message,
                            "outbox message dead-lettered"
                        );
                        true
                    }
                }
            }
        };

        // The last message settling may complete the whole execution
        if settled_final {
            try_finalize(self.store.as_ref(), execution_id).await?;
        }
        Ok(())
    }

    /// One delivery attempt. Returns the output on success, the error message
    /// on any failure (engine errors and business failures alike retry).
    async fn attempt(&self, message: &ClaimedOutboxMessage) -> Result<serde_json::Value, String> {
        let payload: OutboxPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| format!("invalid outbox payload: {e}"))?;
        let executor = self
            .registry
            .get_for_event(&message.event_type)
            .map_err(|e| e.to_string())?;

        let ctx = ExecutionContext::new(
            message.execution_id,
            payload.account_id,
            payload.node_id,
            payload.node_config,
            payload.input,
            payload.workflow_data,
        )
        .with_idempotency_key(message.idempotency_key.clone());

        match executor.execute(&ctx).await {
            Ok(result) if result.success => Ok(result.output),
            Ok(result) => Err(result
                .error
                .unwrap_or_else(|| "delivery failed without a message".to_string())),
            Err(err) => Err(err.to_string()),
        }
    }
}
