//! Durable-store writers for the cumulative per-code access metrics.

pub mod error;
pub mod memory;
pub mod mysql;

pub use memory::InMemoryMetricsWriter;
pub use mysql::MySqlMetricsWriter;
