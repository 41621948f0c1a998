//! `Database` trait — the durable node table as seen by the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::node::{NodeAttributes, NodeIdentity, WorkerNode};

/// Backend-agnostic durable storage for worker nodes.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// All rows whose last heartbeat is at or after `since`.
    async fn find_recently_heartbeated(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkerNode>, DatabaseError>;

    /// Look up a row by its four-part identity.
    async fn find_by_identity(
        &self,
        identity: &NodeIdentity,
    ) -> Result<Option<WorkerNode>, DatabaseError>;

    /// Create the row for `identity` if missing, otherwise overwrite its
    /// mutable fields. Either way the heartbeat timestamp becomes
    /// `heartbeat_at`. Returns the persisted row and whether it already existed.
    async fn upsert_by_identity(
        &self,
        identity: &NodeIdentity,
        attributes: &NodeAttributes,
        heartbeat_at: DateTime<Utc>,
    ) -> Result<(WorkerNode, bool), DatabaseError>;
}
