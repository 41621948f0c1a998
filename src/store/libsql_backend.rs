//! libSQL implementation of the worker-node [`Database`].
//!
//! One connection serves every query. Upserts are serialized and each runs
//! inside an immediate transaction, so the "was it already there" answer is
//! exact even with concurrent first heartbeats.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::node::{NodeAttributes, NodeIdentity, WorkerNode};
use crate::store::migrations;
use crate::store::traits::Database;

/// Worker-node table on libSQL.
pub struct LibSqlBackend {
    // Owns the database the connection was opened from.
    _db: LibSqlDatabase,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a database file, creating parent directories, and
    /// bring its schema up to date.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let backend = Self::open(path).await?;
        info!(path = %path.display(), "Worker node store opened");
        Ok(backend)
    }

    /// Private in-memory store. Used by tests and throwaway pools.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open(Path::new(":memory:")).await
    }

    async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("open worker node store: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("connect worker node store: {e}")))?;

        let backend = Self {
            _db: db,
            conn,
            write_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that `TEXT` comparison in SQL orders by time.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(column: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad {column} timestamp {s:?}: {e}")))
}

/// Map a libsql Row to a WorkerNode.
///
/// Column order matches NODE_COLUMNS:
/// 0:id, 1:host_name, 2:zone_code, 3:region_code, 4:env, 5:region_name,
/// 6:zone_name, 7:ip, 8:port, 9:last_heartbeat, 10:created_at, 11:updated_at
fn row_to_node(row: &libsql::Row) -> Result<WorkerNode, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("worker_nodes column {idx}: {e}")))
    };

    let id_str = get_text(0)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("bad node id {id_str:?}: {e}")))?;

    let port_raw: i64 = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("worker_nodes port: {e}")))?;
    let port = u16::try_from(port_raw)
        .map_err(|_| DatabaseError::Serialization(format!("port {port_raw} out of range")))?;

    Ok(WorkerNode {
        id,
        identity: NodeIdentity {
            host_name: get_text(1)?,
            zone_code: get_text(2)?,
            region_code: get_text(3)?,
            env: get_text(4)?,
        },
        attributes: NodeAttributes {
            region_name: get_text(5)?,
            zone_name: get_text(6)?,
            ip: get_text(7)?,
            port,
        },
        last_heartbeat: parse_datetime("last_heartbeat", &get_text(9)?)?,
        created_at: parse_datetime("created_at", &get_text(10)?)?,
        updated_at: parse_datetime("updated_at", &get_text(11)?)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const NODE_COLUMNS: &str = "id, host_name, zone_code, region_code, env, region_name, zone_name, ip, port, last_heartbeat, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn find_recently_heartbeated(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkerNode>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM worker_nodes WHERE last_heartbeat >= ?1 ORDER BY created_at, id"
                ),
                params![format_datetime(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_recently_heartbeated: {e}")))?;

        let mut nodes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_recently_heartbeated: {e}")))?
        {
            nodes.push(row_to_node(&row)?);
        }

        debug!(count = nodes.len(), since = %since, "Loaded recently heartbeated nodes");
        Ok(nodes)
    }

    async fn find_by_identity(
        &self,
        identity: &NodeIdentity,
    ) -> Result<Option<WorkerNode>, DatabaseError> {
        select_by_identity(&self.conn, identity).await
    }

    async fn upsert_by_identity(
        &self,
        identity: &NodeIdentity,
        attributes: &NodeAttributes,
        heartbeat_at: DateTime<Utc>,
    ) -> Result<(WorkerNode, bool), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_by_identity: begin: {e}")))?;

        let found = select_by_identity(&tx, identity).await?.is_some();

        // Only the insert branch keeps this id and created_at.
        let fresh = WorkerNode::new(identity.clone(), attributes.clone(), heartbeat_at);
        let stamp = format_datetime(fresh.last_heartbeat);
        tx.execute(
            "INSERT INTO worker_nodes (id, host_name, zone_code, region_code, env, region_name, zone_name, ip, port, last_heartbeat, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)
             ON CONFLICT (host_name, zone_code, env, region_code) DO UPDATE SET
                region_name = ?6, zone_name = ?7, ip = ?8, port = ?9,
                last_heartbeat = ?10, updated_at = ?10",
            params![
                fresh.id.to_string(),
                fresh.identity.host_name.as_str(),
                fresh.identity.zone_code.as_str(),
                fresh.identity.region_code.as_str(),
                fresh.identity.env.as_str(),
                fresh.attributes.region_name.as_str(),
                fresh.attributes.zone_name.as_str(),
                fresh.attributes.ip.as_str(),
                i64::from(fresh.attributes.port),
                stamp,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_by_identity: {e}")))?;

        let node = select_by_identity(&tx, identity).await?.ok_or_else(|| {
            DatabaseError::Query(format!("upsert_by_identity: row for {identity} missing after write"))
        })?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_by_identity: commit: {e}")))?;

        debug!(node = %identity, found, "Worker node upserted");
        Ok((node, found))
    }
}

async fn select_by_identity(
    conn: &Connection,
    identity: &NodeIdentity,
) -> Result<Option<WorkerNode>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {NODE_COLUMNS} FROM worker_nodes
                 WHERE host_name = ?1 AND zone_code = ?2 AND env = ?3 AND region_code = ?4"
            ),
            params![
                identity.host_name.as_str(),
                identity.zone_code.as_str(),
                identity.env.as_str(),
                identity.region_code.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_by_identity: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_node(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("find_by_identity: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn identity(host: &str) -> NodeIdentity {
        NodeIdentity::new(host, "z1", "r1", "prod")
    }

    fn attrs(ip: &str, port: u16) -> NodeAttributes {
        NodeAttributes {
            region_name: "Region One".into(),
            zone_name: "Zone One".into(),
            ip: ip.into(),
            port,
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let db = test_db().await;
        let id = identity("host-a");

        let (created, found) = db
            .upsert_by_identity(&id, &attrs("10.0.0.1", 8080), at(0))
            .await
            .unwrap();
        assert!(!found);
        assert_eq!(created.identity, id);
        assert_eq!(created.last_heartbeat, at(0));
        assert_eq!(created.created_at, at(0));

        let (updated, found) = db
            .upsert_by_identity(&id, &attrs("10.0.0.2", 9090), at(5))
            .await
            .unwrap();
        assert!(found);
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.attributes.ip, "10.0.0.2");
        assert_eq!(updated.attributes.port, 9090);
        assert_eq!(updated.last_heartbeat, at(5));
        assert_eq!(updated.created_at, at(0));
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row() {
        let db = test_db().await;
        let id = identity("host-a");

        for secs in 0..5 {
            db.upsert_by_identity(&id, &attrs("10.0.0.1", 8080), at(secs))
                .await
                .unwrap();
        }

        let rows = db.find_recently_heartbeated(at(-60)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_heartbeat, at(4));
    }

    #[tokio::test]
    async fn region_is_part_of_identity() {
        let db = test_db().await;
        let r1 = NodeIdentity::new("host-a", "z1", "r1", "prod");
        let r2 = NodeIdentity::new("host-a", "z1", "r2", "prod");

        db.upsert_by_identity(&r1, &attrs("10.0.0.1", 80), at(0))
            .await
            .unwrap();
        let (_, found) = db
            .upsert_by_identity(&r2, &attrs("10.0.0.1", 80), at(0))
            .await
            .unwrap();
        assert!(!found);

        let rows = db.find_recently_heartbeated(at(-1)).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn recent_query_filters_by_cutoff() {
        let db = test_db().await;
        db.upsert_by_identity(&identity("old"), &attrs("10.0.0.1", 80), at(0))
            .await
            .unwrap();
        db.upsert_by_identity(&identity("edge"), &attrs("10.0.0.2", 80), at(10))
            .await
            .unwrap();
        db.upsert_by_identity(&identity("new"), &attrs("10.0.0.3", 80), at(20))
            .await
            .unwrap();

        let rows = db.find_recently_heartbeated(at(10)).await.unwrap();
        let hosts: Vec<_> = rows.iter().map(|n| n.identity.host_name.as_str()).collect();
        assert_eq!(hosts, vec!["edge", "new"]);
    }

    #[tokio::test]
    async fn cutoff_compares_subsecond_times() {
        let db = test_db().await;
        let base = at(0);
        db.upsert_by_identity(
            &identity("a"),
            &attrs("10.0.0.1", 80),
            base + Duration::milliseconds(900),
        )
        .await
        .unwrap();

        assert_eq!(
            db.find_recently_heartbeated(base + Duration::milliseconds(100))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            db.find_recently_heartbeated(base + Duration::seconds(1))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn find_by_identity_not_found() {
        let db = test_db().await;
        assert!(db.find_by_identity(&identity("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("workers.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        db.upsert_by_identity(&identity("a"), &attrs("10.0.0.1", 80), at(0))
            .await
            .unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn init_schema_runs_on_spawned_task() {
        let db = Arc::new(test_db().await);
        let task = tokio::spawn({
            let db = Arc::clone(&db);
            async move { db.init_schema().await }
        });
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_first_upserts_report_one_creation() {
        let db = Arc::new(test_db().await);

        let mut handles = Vec::new();
        for i in 0..8u16 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.upsert_by_identity(&identity("racer"), &attrs("10.0.0.1", 8000 + i), at(0))
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let (node, found) = handle.await.unwrap();
            if !found {
                created += 1;
            }
            ids.insert(node.id);
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(db.find_recently_heartbeated(at(-1)).await.unwrap().len(), 1);
    }
}
