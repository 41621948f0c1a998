//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Nodes whose last heartbeat is older than this are treated as dead.
    pub heartbeat_timeout: Duration,
    /// How often the in-memory view is reconciled against the durable store.
    pub sync_interval: Duration,
    /// How often timed-out nodes are swept from memory.
    pub evict_interval: Duration,
    /// Upper bound on a single durable store call.
    pub store_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            sync_interval: Duration::from_secs(10),
            evict_interval: Duration::from_secs(1),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Build a config from `WORKER_POOL_*` environment variables, falling back
    /// to defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let heartbeat_timeout = read_duration(
            &lookup,
            "WORKER_POOL_HEARTBEAT_TIMEOUT_SECS",
            Duration::from_secs,
        )?
        .unwrap_or(defaults.heartbeat_timeout);

        let sync_interval =
            read_duration(&lookup, "WORKER_POOL_SYNC_INTERVAL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.sync_interval);

        let evict_interval =
            read_duration(&lookup, "WORKER_POOL_EVICT_INTERVAL_MS", Duration::from_millis)?
                .unwrap_or(defaults.evict_interval);

        let store_timeout =
            read_duration(&lookup, "WORKER_POOL_STORE_TIMEOUT_SECS", Duration::from_secs)?
                .unwrap_or(defaults.store_timeout);

        Ok(Self {
            heartbeat_timeout,
            sync_interval,
            evict_interval,
            store_timeout,
        })
    }
}

/// Parse a positive integer duration. `Ok(None)` when the key is unset.
fn read_duration<F>(
    lookup: &F,
    key: &str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a whole number: {e}"),
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(Some(unit(value)))
}
