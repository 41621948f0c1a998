//! Worker node records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a worker node. Immutable once the node is first recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub host_name: String,
    pub zone_code: String,
    pub region_code: String,
    pub env: String,
}

impl NodeIdentity {
    pub fn new(
        host_name: impl Into<String>,
        zone_code: impl Into<String>,
        region_code: impl Into<String>,
        env: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            zone_code: zone_code.into(),
            region_code: region_code.into(),
            env: env.into(),
        }
    }

    /// Partition this identity is selected from. Region is not part of it.
    pub fn partition(&self) -> PartitionKey {
        PartitionKey {
            zone_code: self.zone_code.clone(),
            env: self.env.clone(),
        }
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}/{}/{}",
            self.host_name, self.region_code, self.zone_code, self.env
        )
    }
}

/// Fields overwritten on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub region_name: String,
    pub zone_name: String,
    pub ip: String,
    pub port: u16,
}

/// An inbound heartbeat as handed over by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub identity: NodeIdentity,
    pub attributes: NodeAttributes,
}

impl WorkerHeartbeat {
    pub fn new(identity: NodeIdentity, attributes: NodeAttributes) -> Self {
        Self {
            identity,
            attributes,
        }
    }
}

/// (zone code, environment) pair that owns one selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub zone_code: String,
    pub env: String,
}

impl PartitionKey {
    pub fn new(zone_code: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            zone_code: zone_code.into(),
            env: env.into(),
        }
    }
}

/// A worker node as persisted in the durable table and held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: Uuid,
    pub identity: NodeIdentity,
    pub attributes: NodeAttributes,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerNode {
    /// Build a fresh record for a node seen for the first time.
    pub fn new(identity: NodeIdentity, attributes: NodeAttributes, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            attributes,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// `host:port` of the worker.
    pub fn address(&self) -> String {
        format!("{}:{}", self.attributes.ip, self.attributes.port)
    }

    /// Time since the last heartbeat. Zero if the heartbeat lies in the future.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the node has gone longer than `timeout` without a heartbeat.
    /// An age exactly equal to the timeout still counts as live.
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }
}
