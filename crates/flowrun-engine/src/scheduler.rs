//! Scheduler: cron fires and sleep/wake
//!
//! Cron registrations live in memory, loaded from the store at startup and
//! updated on schedule mutations; at most one registration exists per
//! workflow id. The sleep poller requeues executions whose `wake_up_at` has
//! passed, using compare-and-set so multiple scheduler instances stay
//! idempotent.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use flowrun_core::{ExecutionStatus, TriggerType, ValidationError};
use flowrun_storage::{NewJob, WorkflowStore};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::triggers::TriggerService;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick interval for both cron checks and the sleep poller
    pub tick_interval: Duration,

    /// Sleep schedules claimed per tick
    pub wake_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            wake_batch_size: 100,
        }
    }
}

struct CronEntry {
    schedule: Schedule,
    timezone: Tz,
    next_fire: DateTime<Utc>,
}

/// The scheduler
pub struct Scheduler<S: WorkflowStore> {
    store: Arc<S>,
    triggers: Arc<TriggerService<S>>,
    config: SchedulerConfig,
    cron: Mutex<HashMap<Uuid, CronEntry>>,
}

impl<S: WorkflowStore> Scheduler<S> {
    pub fn new(store: Arc<S>, triggers: Arc<TriggerService<S>>) -> Self {
        Self {
            store,
            triggers,
            config: SchedulerConfig::default(),
            cron: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register (or replace) the cron schedule for a workflow. Invalid
    /// expressions and timezones are rejected here, at registration time.
    pub fn register_cron(
        &self,
        workflow_id: Uuid,
        expression: &str,
        timezone: &str,
    ) -> Result<(), ValidationError> {
        let schedule = Schedule::from_str(expression).map_err(|e| ValidationError::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        let tz: Tz = timezone.parse().map_err(|_| ValidationError::InvalidCron {
            expression: expression.to_string(),
            message: format!("invalid timezone: {timezone:?}"),
        })?;
        let next_fire = next_occurrence(&schedule, tz, Utc::now()).ok_or_else(|| {
            ValidationError::InvalidCron {
                expression: expression.to_string(),
                message: "schedule has no upcoming occurrence".to_string(),
            }
        })?;

        // At most one active registration per workflow id
        self.cron.lock().insert(
            workflow_id,
            CronEntry {
                schedule,
                timezone: tz,
                next_fire,
            },
        );
        info!(%workflow_id, expression, timezone, %next_fire, "cron registered");
        Ok(())
    }

    /// Remove a workflow's cron registration (deactivation, deletion)
    pub fn unregister_cron(&self, workflow_id: Uuid) {
        if self.cron.lock().remove(&workflow_id).is_some() {
            info!(%workflow_id, "cron unregistered");
        }
    }

    pub fn cron_count(&self) -> usize {
        self.cron.lock().len()
    }

    /// Load registrations for every active workflow with a schedule.
    /// Workflows whose stored expression no longer parses are skipped with a
    /// warning rather than failing startup.
    pub async fn load_from_store(&self) -> Result<usize, EngineError> {
        let workflows = self.store.list_cron_workflows().await?;
        let mut registered = 0;
        for workflow in workflows {
            let Some(expression) = workflow.schedule.as_deref() else {
                continue;
            };
            match self.register_cron(workflow.id, expression, &workflow.timezone) {
                Ok(()) => registered += 1,
                Err(err) => {
                    warn!(workflow_id = %workflow.id, error = %err, "skipping invalid cron registration");
                }
            }
        }
        info!(registered, "cron registrations loaded");
        Ok(registered)
    }

    /// Tick loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick_interval.as_millis() as u64, "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            if let Err(err) = self.fire_due_crons(now).await {
                warn!(error = %err, "cron tick failed");
            }
            match self.wake_due_sleepers(now).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "woke sleeping executions"),
                Err(err) => warn!(error = %err, "sleep wake tick failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("scheduler stopped");
    }

    /// Fire every cron whose next occurrence has passed.
    #[instrument(skip(self))]
    pub async fn fire_due_crons(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        // Collect due workflows without holding the lock across awaits
        let due: Vec<Uuid> = {
            let cron = self.cron.lock();
            cron.iter()
                .filter(|(_, entry)| entry.next_fire <= now)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut fired = 0;
        for workflow_id in due {
            match self
                .triggers
                .execute_workflow(workflow_id, json!({}), TriggerType::Scheduled)
                .await
            {
                Ok((_, execution_id)) => {
                    fired += 1;
                    info!(%workflow_id, %execution_id, "cron fired");
                }
                Err(err) => {
                    warn!(%workflow_id, error = %err, "cron trigger failed");
                }
            }

            // Advance past `now` even when the trigger failed, so a broken
            // workflow does not fire on every tick
            let mut cron = self.cron.lock();
            if let Some(entry) = cron.get_mut(&workflow_id) {
                match next_occurrence(&entry.schedule, entry.timezone, now) {
                    Some(next) => entry.next_fire = next,
                    None => {
                        cron.remove(&workflow_id);
                    }
                }
            }
        }
        Ok(fired)
    }

    /// Requeue executions whose sleep has elapsed and enqueue resume jobs.
    #[instrument(skip(self))]
    pub async fn wake_due_sleepers(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self
            .store
            .due_sleep_schedules(now, self.config.wake_batch_size)
            .await?;

        let mut woken = 0;
        for schedule in due {
            // CAS: idempotent against concurrent scheduler instances
            if !self.store.fire_sleep_schedule(schedule.id).await? {
                continue;
            }

            let transitioned = self
                .store
                .transition_execution(
                    schedule.execution_id,
                    &[ExecutionStatus::Sleeping],
                    ExecutionStatus::Queued,
                )
                .await?;
            if !transitioned {
                // Cancelled or otherwise moved on while asleep
                debug!(execution_id = %schedule.execution_id, "sleeper no longer sleeping, skipping");
                continue;
            }

            let execution = self.store.get_execution(schedule.execution_id).await?;
            self.store
                .enqueue_job(NewJob::workflow_run(
                    schedule.workflow_id,
                    schedule.execution_id,
                    execution.input,
                    TriggerType::Resume,
                ))
                .await?;
            woken += 1;
            info!(
                execution_id = %schedule.execution_id,
                node_id = %schedule.node_id,
                wake_up_at = %schedule.wake_up_at,
                "sleeping execution requeued"
            );
        }
        Ok(woken)
    }
}

/// Next occurrence of a schedule after `now`, computed in the workflow's
/// timezone, returned in UTC.
fn next_occurrence(schedule: &Schedule, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_occurrence_respects_timezone() {
        // Every day at 09:00
        let schedule = Schedule::from_str("0 0 9 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let next = next_occurrence(&schedule, tz, now).unwrap();
        // 09:00 Eastern in January is 14:00 UTC (EST)
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 14, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(Schedule::from_str("not a cron").is_err());
    }
}
