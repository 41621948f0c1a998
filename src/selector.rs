//! Per-partition live node set with round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::PoolError;
use crate::node::{PartitionKey, WorkerNode};

/// Live nodes of a single (zone, environment) partition.
///
/// Members keep their insertion order; `pick` walks that order with a cursor
/// so that `k` picks over `k` members return each member exactly once.
/// `pick` only needs `&self`, so concurrent selects can share a read lock.
#[derive(Debug)]
pub struct Selector {
    partition: PartitionKey,
    nodes: Vec<WorkerNode>,
    /// Index of the member the next `pick` returns. Always `< nodes.len()`
    /// while the selector is non-empty.
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(partition: PartitionKey) -> Self {
        Self {
            partition,
            nodes: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Insert a node, or overwrite the member with the same identity in place.
    /// Returns `true` when the node was new to this partition.
    pub fn upsert(&mut self, node: WorkerNode) -> bool {
        match self
            .nodes
            .iter_mut()
            .find(|existing| existing.identity == node.identity)
        {
            Some(existing) => {
                *existing = node;
                false
            }
            None => {
                debug!(
                    zone_code = %self.partition.zone_code,
                    env = %self.partition.env,
                    node = %node.identity,
                    "Node joined partition"
                );
                self.nodes.push(node);
                true
            }
        }
    }

    /// Return the next node in rotation.
    pub fn pick(&self) -> Result<WorkerNode, PoolError> {
        let len = self.nodes.len();
        if len == 0 {
            return Err(PoolError::no_nodes(
                &self.partition.zone_code,
                &self.partition.env,
            ));
        }

        let prev = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some((c % len + 1) % len)
            })
            .unwrap_or_else(|c| c);
        Ok(self.nodes[prev % len].clone())
    }

    /// Drop every member whose heartbeat is older than `now - timeout` and
    /// return the dropped members.
    pub fn evict_older_than(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<WorkerNode> {
        let mut evicted = Vec::new();
        let mut removed_before_cursor = 0;
        let cursor = self.cursor.get_mut();

        let members = std::mem::take(&mut self.nodes);
        for (idx, node) in members.into_iter().enumerate() {
            if node.is_timed_out(now, timeout) {
                if idx < *cursor {
                    removed_before_cursor += 1;
                }
                evicted.push(node);
            } else {
                self.nodes.push(node);
            }
        }

        // Keep pointing at the same surviving member, or wrap.
        *cursor -= removed_before_cursor;
        if *cursor >= self.nodes.len() {
            *cursor = 0;
        }

        evicted
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members in rotation order.
    pub fn nodes(&self) -> &[WorkerNode] {
        &self.nodes
    }
}
