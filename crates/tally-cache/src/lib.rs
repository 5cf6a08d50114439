//! Redis-backed fact index, statistics store, metrics writer and lock, plus
//! in-memory equivalents for tests and single-node runs.

pub mod error;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod redis;

pub use lock::RedisLock;
pub use memory::{InMemoryLock, InMemoryStatsStore};
pub use metrics::RedisMetricsWriter;
pub use redis::{RedisStatsStore, RedisStoreConfig};
