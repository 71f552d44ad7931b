//! # Flowrun Nodes
//!
//! Node executors and the executor registry. Each kind implements the
//! [`flowrun_core::NodeExecutor`] contract; the registry classifies kinds as
//! synchronous (run inline by the DAG runner) or outbox-deferred (queued
//! transactionally, drained by the outbox worker).

pub mod conditional;
pub mod csv_export;
pub mod email;
pub mod http;
pub mod json;
pub mod loops;
pub mod registry;
pub mod slack;
pub mod timing;
pub mod transform;

pub use registry::{events, Dispatch, ExecutorRegistry, RegistryError};
