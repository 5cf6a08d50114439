//! Batch aggregation of URL access statistics.
//!
//! This crate turns the access facts recorded in the cache store into daily
//! aggregates and cumulative totals. It provides the aggregation engine, the
//! dual-write metrics composite, the lock-guarded job coordinator and the
//! batch trigger types used by the `tally-batch` binary.

pub mod composite;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod trigger;

pub use composite::CompositeMetricsWriter;
pub use coordinator::{CoordinatorConfig, InstanceId, JobCoordinator, RunOutcome};
pub use engine::{AggregationConfig, AggregationEngine, AggregationReport, StatisticsAggregator};
pub use error::{AggregationError, TriggerError};
pub use trigger::{parse_target_date, BatchType};
