use std::path::Path;
use std::sync::Arc;

use worker_pool::config::PoolConfig;
use worker_pool::store::{Database, LibSqlBackend};
use worker_pool::{Result, WorkerPool, spawn_background_tasks};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;

    let db_path =
        std::env::var("WORKER_POOL_DB_PATH").unwrap_or_else(|_| "./data/worker-pool.db".to_string());
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(Path::new(&db_path)).await?);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db_path = %db_path,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        sync_interval_secs = config.sync_interval.as_secs(),
        evict_interval_ms = config.evict_interval.as_millis() as u64,
        "Worker pool starting"
    );

    let pool = WorkerPool::new(config, store);
    let tasks = spawn_background_tasks(Arc::clone(&pool));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    tasks.shutdown().await;

    let live: usize = pool.snapshot().await.iter().map(|p| p.nodes.len()).sum();
    tracing::info!(live_nodes = live, "Worker pool stopped");

    Ok(())
}
