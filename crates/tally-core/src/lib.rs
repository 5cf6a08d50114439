//! Core types and traits for the tally statistics pipeline.
//!
//! This crate provides the key layout, data model and the store, metrics and
//! lock traits shared by the cache, storage and aggregator crates.

pub mod error;
pub mod keyspace;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod shortcode;
pub mod store;

pub use error::{CoreError, MetricsError, StoreError};
pub use lock::{DistributedLock, LockToken};
pub use metrics::MetricsWriter;
pub use model::{today_utc, utc_date, AccessFact, DailyAggregate};
pub use shortcode::ShortCode;
pub use store::{AccessRecorder, FactReader, StatisticsStore};
