//! Job queue worker pool
//!
//! Claims "run this execution" jobs from the durable queue and drives the
//! DAG runner. Two logical queues (`default` and `workflow`) run with
//! distinct concurrency caps; claiming is compare-and-set so any number of
//! worker processes can share a queue. Jobs are idempotent with respect to
//! the execution id: re-delivery finds the execution row and applies the
//! checkpoint resume logic.

use std::sync::Arc;
use std::time::Duration;

use flowrun_storage::{ClaimedJob, JobFailureOutcome, WorkflowStore};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::runner::{try_finalize, DagRunner, RunOutcome};

/// One logical queue and its concurrency cap
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct JobWorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queues this pool serves
    pub queues: Vec<QueueConfig>,

    /// Minimum poll interval (when jobs are available)
    pub min_poll_interval: Duration,

    /// Maximum poll interval (when idle)
    pub max_poll_interval: Duration,

    /// Backoff multiplier when no jobs are found
    pub backoff_multiplier: f64,

    /// Jobs claimed per poll, bounded by free permits
    pub batch_size: usize,

    /// Job heartbeat interval
    pub heartbeat_interval: Duration,

    /// How often to reclaim stale jobs
    pub stale_reclaim_interval: Duration,

    /// How long without a heartbeat before a job is stale
    pub stale_threshold: Duration,
}

impl Default for JobWorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: vec![
                QueueConfig::new("default", 4),
                QueueConfig::new("workflow", 8),
            ],
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

impl JobWorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Worker pool driving DAG runner workers off the job queue
pub struct JobWorkerPool<S: WorkflowStore> {
    store: Arc<S>,
    runner: Arc<DagRunner<S>>,
    config: JobWorkerPoolConfig,
}

impl<S: WorkflowStore> JobWorkerPool<S> {
    pub fn new(store: Arc<S>, runner: Arc<DagRunner<S>>) -> Self {
        Self {
            store,
            runner,
            config: JobWorkerPoolConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobWorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Run all queue loops plus the stale-job reclaimer until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.config.worker_id, queues = self.config.queues.len(), "job worker pool started");

        let mut handles = Vec::new();
        for queue in &self.config.queues {
            handles.push(tokio::spawn(queue_loop(
                self.store.clone(),
                self.runner.clone(),
                self.config.clone(),
                queue.clone(),
                shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(reclaim_loop(
            self.store.clone(),
            self.config.clone(),
            shutdown.clone(),
        )));

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "pool task panicked");
            }
        }
        info!("job worker pool stopped");
    }

    /// Claim and process one batch from a queue inline. Returns how many jobs
    /// ran. Used by tests and single-shot maintenance commands.
    pub async fn tick(&self, queue: &str) -> Result<usize, EngineError> {
        let jobs = self
            .store
            .claim_jobs(queue, &self.config.worker_id, self.config.batch_size)
            .await?;
        let count = jobs.len();
        for job in jobs {
            process_job(&self.store, &self.runner, job).await;
        }
        Ok(count)
    }
}

async fn queue_loop<S: WorkflowStore>(
    store: Arc<S>,
    runner: Arc<DagRunner<S>>,
    config: JobWorkerPoolConfig,
    queue: QueueConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(queue.concurrency));
    let mut interval = config.min_poll_interval;

    debug!(queue = %queue.name, concurrency = queue.concurrency, "queue loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let free = semaphore.available_permits();
        let batch = free.min(config.batch_size);
        let claimed = if batch == 0 {
            Vec::new()
        } else {
            match store
                .claim_jobs(&queue.name, &config.worker_id, batch)
                .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(queue = %queue.name, error = %err, "job claim failed");
                    Vec::new()
                }
            }
        };

        if claimed.is_empty() {
            // No jobs (or no capacity): back off
            interval = Duration::from_secs_f64(
                (interval.as_secs_f64() * config.backoff_multiplier)
                    .min(config.max_poll_interval.as_secs_f64()),
            );
            trace!(queue = %queue.name, interval_ms = interval.as_millis() as u64, "no jobs, backing off");
        } else {
            interval = config.min_poll_interval;
            debug!(queue = %queue.name, count = claimed.len(), "claimed jobs");
            for job in claimed {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let store = store.clone();
                let runner = runner.clone();
                let worker_id = config.worker_id.clone();
                let heartbeat_interval = config.heartbeat_interval;
                tokio::spawn(async move {
                    let _permit = permit;
                    let heartbeat = spawn_heartbeat(
                        store.clone(),
                        job.id,
                        worker_id,
                        heartbeat_interval,
                    );
                    process_job(&store, &runner, job).await;
                    heartbeat.abort();
                });
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    // Drain: wait for in-flight jobs before returning
    let _ = semaphore.acquire_many(queue.concurrency as u32).await;
    debug!(queue = %queue.name, "queue loop stopped");
}

fn spawn_heartbeat<S: WorkflowStore>(
    store: Arc<S>,
    job_id: Uuid,
    worker_id: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match store.heartbeat_job(job_id, &worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // No longer ours (reclaimed); stop heartbeating
                    break;
                }
                Err(err) => {
                    warn!(%job_id, error = %err, "job heartbeat failed");
                }
            }
        }
    })
}

#[instrument(skip(store, runner, job), fields(job_id = %job.id, execution_id = %job.execution_id))]
async fn process_job<S: WorkflowStore>(store: &Arc<S>, runner: &Arc<DagRunner<S>>, job: ClaimedJob) {
    let execution_id = job.execution_id;
    match runner.run(execution_id).await {
        Ok(outcome) => {
            if let Err(err) = store.complete_job(job.id).await {
                warn!(error = %err, "failed to complete job");
                return;
            }
            if outcome == RunOutcome::AwaitingOutbox {
                // The last outbox message may have settled while the job was
                // still claimed; re-check now that it is completed.
                if let Err(err) = try_finalize(store.as_ref(), execution_id).await {
                    warn!(error = %err, "post-job finalize failed");
                }
            }
            debug!(?outcome, "job finished");
        }
        Err(err) => {
            warn!(error = %err, attempt = job.attempt, "job failed");
            match store.fail_job(job.id, &err.to_string()).await {
                Ok(JobFailureOutcome::WillRetry { next_attempt, delay }) => {
                    debug!(next_attempt, delay_ms = delay.as_millis() as u64, "job will retry");
                }
                Ok(JobFailureOutcome::Failed) => {
                    warn!("job exhausted retries");
                }
                Err(store_err) => {
                    error!(error = %store_err, "failed to record job failure");
                }
            }
        }
    }
}

async fn reclaim_loop<S: WorkflowStore>(
    store: Arc<S>,
    config: JobWorkerPoolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.stale_reclaim_interval) => {}
            _ = shutdown.changed() => continue,
        }
        match store.reclaim_stale_jobs(config.stale_threshold).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "reclaimed stale jobs");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "stale job reclaim failed"),
        }
    }
}
