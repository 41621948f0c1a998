//! Schema for the worker node table.
//!
//! Versions are recorded in `_migrations`; only versions above the recorded
//! maximum are applied.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "worker_nodes",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_nodes (
                id TEXT PRIMARY KEY,
                host_name TEXT NOT NULL,
                zone_code TEXT NOT NULL,
                region_code TEXT NOT NULL,
                env TEXT NOT NULL,
                region_name TEXT NOT NULL DEFAULT '',
                zone_name TEXT NOT NULL DEFAULT '',
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                last_heartbeat TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (host_name, zone_code, env, region_code)
            );
            CREATE INDEX IF NOT EXISTS idx_worker_nodes_partition
                ON worker_nodes(zone_code, env);
        "#,
    },
    Migration {
        version: 2,
        name: "worker_nodes_heartbeat_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_worker_nodes_last_heartbeat
                ON worker_nodes(last_heartbeat);
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each step runs in its own transaction together with its `_migrations`
/// record, so a failed step leaves the previous version in place.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for migration in pending {
        apply(conn, migration).await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied worker node migration"
        );
    }

    let version = schema_version(conn).await?;
    tracing::debug!(version, "Worker node schema up to date");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let fail = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
    };

    let tx = conn.transaction().await.map_err(fail)?;
    tx.execute_batch(migration.sql).await.map_err(fail)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)
}

/// Highest applied version, 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let fail = |e: libsql::Error| DatabaseError::Migration(format!("read schema version: {e}"));

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(fail)?;
    match rows.next().await.map_err(fail)? {
        Some(row) => row.get::<i64>(0).map_err(fail),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn index_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?1",
                libsql::params![name],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        count == 1
    }

    #[tokio::test]
    async fn migrations_create_worker_nodes() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='worker_nodes'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 1);

        assert!(index_exists(&conn, "idx_worker_nodes_partition").await);
        assert!(index_exists(&conn, "idx_worker_nodes_last_heartbeat").await);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = schema_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn identity_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO worker_nodes (id, host_name, zone_code, region_code, env, ip, port, last_heartbeat, created_at, updated_at)
                      VALUES (?1, 'h', 'z1', 'r1', 'prod', '10.0.0.1', 80, 't', 't', 't')";
        conn.execute(insert, libsql::params!["one"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["two"]).await.is_err());
    }

    #[tokio::test]
    async fn migration_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let conn = test_conn().await;
        let fut = run_migrations(&conn);
        assert_send(&fut);
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn failed_step_keeps_previous_version() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let broken = Migration {
            version: 99,
            name: "broken",
            sql: "CREATE TABLE worker_nodes (id TEXT);",
        };
        assert!(apply(&conn, &broken).await.is_err());
        assert_eq!(schema_version(&conn).await.unwrap(), 2);
    }
}
