//! Standalone maintenance process: runs the sweeper against the Postgres job
//! store so lease recovery and retry promotion continue while no dispatcher
//! is up.

use std::sync::Arc;

use anyhow::Context;

use pipeq_infra::{JobQueue, PostgresJobStore, QueueConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pipeq_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let config = QueueConfig::from_env().context("invalid PIPEQ_* configuration")?;

    let store = PostgresJobStore::connect(&database_url, 4)
        .await
        .context("failed to connect to Postgres")?;
    store.ensure_schema().await.context("failed to prepare job schema")?;

    // The store blocks on this runtime, so the queue lives on blocking threads.
    let sweeper = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let queue = JobQueue::new(Arc::new(store), config)?;
        Ok(queue.spawn_sweeper()?)
    })
    .await??;

    tracing::info!("janitor running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    tokio::task::spawn_blocking(move || sweeper.shutdown()).await?;
    Ok(())
}
