//! The in-memory registry of live worker nodes.
//!
//! Nodes are indexed zone code → environment → [`Selector`]. The whole map
//! sits behind one `RwLock`: heartbeats, reconciliation and eviction take the
//! write lock, selection takes the read lock. Durable store calls always
//! happen before the write lock is taken, so a slow store never holds up
//! selection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PoolConfig;
use crate::error::{DatabaseError, PoolError};
use crate::node::{PartitionKey, WorkerHeartbeat, WorkerNode};
use crate::selector::Selector;
use crate::store::Database;

/// zone code → environment → selector.
type PartitionMap = HashMap<String, HashMap<String, Selector>>;

/// Members of one partition at the time of a [`WorkerPool::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct PartitionSnapshot {
    pub partition: PartitionKey,
    pub nodes: Vec<WorkerNode>,
}

/// Thread-safe, partitioned view of live worker nodes.
pub struct WorkerPool {
    config: PoolConfig,
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    partitions: RwLock<PartitionMap>,
}

impl WorkerPool {
    /// Create an empty pool on the system clock.
    pub fn new(config: PoolConfig, store: Arc<dyn Database>) -> Arc<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create an empty pool on a caller-supplied clock.
    pub fn with_clock(
        config: PoolConfig,
        store: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            clock,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Record a heartbeat. Failures are logged, not returned.
    pub async fn heartbeat(&self, heartbeat: WorkerHeartbeat) {
        let node = heartbeat.identity.to_string();
        if let Err(e) = self.try_heartbeat(heartbeat).await {
            warn!(node = %node, error = %e, "Worker heartbeat dropped");
        }
    }

    /// Persist a heartbeat, then merge the persisted record into memory.
    ///
    /// A store failure leaves the in-memory view untouched.
    pub async fn try_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<WorkerNode, PoolError> {
        let now = self.clock.now();
        let (node, found) = self
            .store_call(self.store.upsert_by_identity(
                &heartbeat.identity,
                &heartbeat.attributes,
                now,
            ))
            .await?;

        let joined = {
            let mut partitions = self.partitions.write().await;
            merge_node(&mut partitions, node.clone())
        };

        if !found {
            info!(
                node = %node.identity,
                address = %node.address(),
                "New worker node registered"
            );
        } else if joined {
            info!(node = %node.identity, "Worker node rejoined");
        }

        Ok(node)
    }

    /// Pick one live node from the (zone, environment) partition.
    ///
    /// Never touches the durable store.
    pub async fn select(&self, zone_code: &str, env: &str) -> Result<WorkerNode, PoolError> {
        let partitions = self.partitions.read().await;
        partitions
            .get(zone_code)
            .and_then(|envs| envs.get(env))
            .ok_or_else(|| PoolError::no_nodes(zone_code, env))?
            .pick()
    }

    /// Merge every recently heartbeated row from the store into memory.
    /// Returns the number of rows merged.
    pub async fn reconcile_from_store(&self) -> Result<usize, PoolError> {
        let since = self.cutoff(self.clock.now());
        let nodes = self
            .store_call(self.store.find_recently_heartbeated(since))
            .await?;

        let count = nodes.len();
        let mut joined = 0;
        {
            let mut partitions = self.partitions.write().await;
            for node in nodes {
                if merge_node(&mut partitions, node) {
                    joined += 1;
                }
            }
        }

        debug!(count, joined, "Reconciled worker nodes from store");
        Ok(count)
    }

    /// Drop nodes whose heartbeat is older than the configured timeout.
    /// Returns the number of nodes removed.
    pub async fn evict_timed_out(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.config.heartbeat_timeout;
        let mut evicted = 0;

        let mut partitions = self.partitions.write().await;
        for selector in partitions.values_mut().flat_map(|envs| envs.values_mut()) {
            for node in selector.evict_older_than(now, timeout) {
                info!(
                    node = %node.identity,
                    last_heartbeat = %node.last_heartbeat,
                    "Worker node timed out"
                );
                evicted += 1;
            }
        }

        evicted
    }

    /// Copy of every known partition and its members, ordered by partition.
    /// Partitions that exist but are currently empty are included.
    pub async fn snapshot(&self) -> Vec<PartitionSnapshot> {
        let partitions = self.partitions.read().await;
        let mut snapshot: Vec<PartitionSnapshot> = partitions
            .values()
            .flat_map(|envs| envs.values())
            .map(|selector| PartitionSnapshot {
                partition: selector.partition().clone(),
                nodes: selector.nodes().to_vec(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.partition.cmp(&b.partition));
        snapshot
    }

    /// Oldest heartbeat that still counts as live.
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.heartbeat_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run a store call under the configured store timeout.
    async fn store_call<T, F>(&self, call: F) -> Result<T, PoolError>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        let timeout = self.config.store_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PoolError::StoreTimeout { timeout }),
        }
    }
}

/// Upsert `node` into its partition, creating the partition if needed.
/// Caller must hold the write lock. Returns `true` if the node was new to
/// its partition.
fn merge_node(partitions: &mut PartitionMap, node: WorkerNode) -> bool {
    let key = node.identity.partition();
    partitions
        .entry(key.zone_code.clone())
        .or_default()
        .entry(key.env.clone())
        .or_insert_with(|| Selector::new(key))
        .upsert(node)
}
