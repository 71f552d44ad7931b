use std::sync::Arc;

use anyhow::Result;
use flowrun_core::LogEmailSender;
use flowrun_engine::{DagRunner, JobWorkerPool, OutboxWorker, Scheduler, TriggerService};
use flowrun_nodes::ExecutorRegistry;
use flowrun_storage::PostgresWorkflowStore;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowrun_worker=debug,flowrun_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowrun-worker starting...");

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required");
    let store = Arc::new(PostgresWorkflowStore::connect(&database_url).await?);
    tracing::info!("database connection established, migrations applied");

    // TODO: swap LogEmailSender for the provider-backed sender once the
    // provider credentials land in config
    let registry = Arc::new(ExecutorRegistry::standard(Arc::new(LogEmailSender)));
    let runner = Arc::new(DagRunner::new(store.clone(), registry.clone()));
    let triggers = Arc::new(TriggerService::new(store.clone(), registry.clone()));

    let pool = JobWorkerPool::new(store.clone(), runner);
    let outbox = OutboxWorker::new(store.clone(), registry);
    let scheduler = Scheduler::new(store.clone(), triggers);
    scheduler.load_from_store().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tracing::info!("worker ready to execute workflows");
    tokio::select! {
        _ = pool.run(shutdown_rx.clone()) => {}
        _ = outbox.run(shutdown_rx.clone()) => {}
        _ = scheduler.run(shutdown_rx.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown_tx.send(true).ok();
    tracing::info!("flowrun-worker stopped");
    Ok(())
}
