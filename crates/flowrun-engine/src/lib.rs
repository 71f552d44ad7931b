//! # Flowrun Engine
//!
//! The workflow execution subsystem: reliable, persistent execution of node
//! DAGs with at-least-once side effects, exactly-once checkpointed progress,
//! cron and webhook triggers, and durable sleep/resume across restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Trigger adapters                      │
//! │     (manual, scheduled, webhook, resume -> execution)     │
//! └──────────────────────────────────────────────────────────┘
//!                             │ enqueue job
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     JobWorkerPool                         │
//! │   (claims jobs per queue, drives DagRunner, heartbeats)   │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                       DagRunner                           │
//! │   (BFS with checkpoints; loop driver; sleep + outbox      │
//! │    handoff; completion detection)                         │
//! └──────────────────────────────────────────────────────────┘
//!            │ sleep_schedules            │ outbox_messages
//!            ▼                            ▼
//! ┌───────────────────────┐   ┌──────────────────────────────┐
//! │       Scheduler       │   │         OutboxWorker         │
//! │ (cron fires, wakes    │   │ (drains side effects with    │
//! │  sleeping executions) │   │  retry/backoff/dead-letter)  │
//! └───────────────────────┘   └──────────────────────────────┘
//! ```

pub mod error;
pub mod loop_driver;
pub mod outbox;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod triggers;

pub use error::EngineError;
pub use outbox::{OutboxWorker, OutboxWorkerConfig};
pub use queue::{JobWorkerPool, JobWorkerPoolConfig, QueueConfig};
pub use runner::{DagRunner, OutboxPayload, RunOutcome};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::{TriggerError, TriggerService};
