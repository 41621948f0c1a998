//! Background loops that keep the pool in step with reality.
//!
//! - the sync loop re-reads recently heartbeated nodes from the store
//!   (first tick fires immediately, so a fresh process is warm right away);
//! - the evict loop drops nodes whose heartbeat has timed out.
//!
//! Both stop when [`BackgroundTasks::shutdown`] is called or the handle is
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;

/// Handles to the running background loops.
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    sync_handle: JoinHandle<()>,
    evict_handle: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Signal both loops to stop and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.sync_handle.await {
            warn!(error = %e, "Sync loop ended abnormally");
        }
        if let Err(e) = self.evict_handle.await {
            warn!(error = %e, "Evict loop ended abnormally");
        }
        info!("Worker pool background tasks stopped");
    }
}

/// Start the sync and evict loops on the intervals from the pool's config.
pub fn spawn_background_tasks(pool: Arc<WorkerPool>) -> BackgroundTasks {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_interval = pool.config().sync_interval;
    let evict_interval = pool.config().evict_interval;

    let sync_handle = spawn_sync_loop(Arc::clone(&pool), sync_interval, shutdown_rx.clone());
    let evict_handle = spawn_evict_loop(pool, evict_interval, shutdown_rx);

    BackgroundTasks {
        shutdown_tx,
        sync_handle,
        evict_handle,
    }
}

/// Periodically reconcile the pool against the durable store.
///
/// A failed cycle is logged and skipped; the next tick tries again.
pub fn spawn_sync_loop(
    pool: Arc<WorkerPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Worker sync loop started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    info!("Worker sync loop shutting down");
                    return;
                }
            }

            match pool.reconcile_from_store().await {
                Ok(count) => debug!(count, "Sync cycle complete"),
                Err(e) => warn!(error = %e, "Sync cycle failed, skipping"),
            }
        }
    })
}

/// Periodically evict timed-out nodes.
pub fn spawn_evict_loop(
    pool: Arc<WorkerPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Worker evict loop started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    info!("Worker evict loop shutting down");
                    return;
                }
            }

            let evicted = pool.evict_timed_out().await;
            if evicted > 0 {
                debug!(evicted, "Evict cycle complete");
            }
        }
    })
}
