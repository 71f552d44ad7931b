//! # Flowrun Storage
//!
//! Durable persistence for the workflow engine. One relational store is the
//! source of truth; all state mutations go through [`WorkflowStore`].
//! Concurrent mutators rely on row-level compare-and-set claims (outbox
//! claim, sleep fire, execution status transitions, job claiming).

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryWorkflowStore;
pub use models::*;
pub use postgres::PostgresWorkflowStore;
pub use store::{
    job_backoff, outbox_backoff, ClaimedJob, ClaimedOutboxMessage, JobFailureOutcome, NewExecution,
    NewJob, NewNodeExecution, NewOutboxMessage, NewSleepSchedule, OutboxFailureOutcome, StoreError,
    WorkflowStore,
};
