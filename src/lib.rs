//! Live, partitioned registry of worker nodes.
//!
//! Workers heartbeat into a durable table; the pool keeps an in-memory view
//! per (zone, environment) partition that is refreshed from the table, kept
//! fresh by heartbeats, swept of timed-out nodes, and queried for one
//! healthy worker at a time.

pub mod clock;
pub mod config;
pub mod error;
pub mod node;
pub mod pool;
pub mod selector;
pub mod store;
pub mod tasks;

pub use error::{Error, PoolError, Result};
pub use node::{NodeAttributes, NodeIdentity, PartitionKey, WorkerHeartbeat, WorkerNode};
pub use pool::{PartitionSnapshot, WorkerPool};
pub use tasks::{BackgroundTasks, spawn_background_tasks};
