//! Error types for the worker pool.

use std::time::Duration;

/// Top-level error type, returned by the service binary's startup path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The partition is unknown or currently holds no live nodes.
    #[error("No worker nodes available in zone {zone_code} env {env}")]
    NoNodesAvailable { zone_code: String, env: String },

    #[error("Durable store error: {0}")]
    DurableStore(#[from] DatabaseError),

    #[error("Durable store call timed out after {timeout:?}")]
    StoreTimeout { timeout: Duration },
}

impl PoolError {
    pub fn no_nodes(zone_code: impl Into<String>, env: impl Into<String>) -> Self {
        Self::NoNodesAvailable {
            zone_code: zone_code.into(),
            env: env.into(),
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_nodes_display_names_partition() {
        let msg = PoolError::no_nodes("z1", "prod").to_string();
        assert!(msg.contains("z1"));
        assert!(msg.contains("prod"));
    }

    #[test]
    fn store_timeout_names_the_bound() {
        let err = PoolError::StoreTimeout {
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("5s"));
    }

    fn startup(step: u8) -> Result<()> {
        match step {
            0 => Err(ConfigError::InvalidValue {
                key: "WORKER_POOL_SYNC_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            }
            .into()),
            1 => Err(DatabaseError::Pool("disk full".into()).into()),
            _ => Err(std::io::Error::other("signal handler").into()),
        }
    }

    #[test]
    fn startup_failures_convert_into_top_level() {
        assert!(matches!(startup(0), Err(Error::Config(_))));
        assert!(matches!(startup(1), Err(Error::Database(_))));
        let err = startup(2).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
