use jiff::civil::Date;
use tally_core::{MetricsError, StoreError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AggregationError {
    /// The per-date index could not be read; nothing was aggregated.
    #[error("failed to list codes for {date}: {source}")]
    Index {
        date: Date,
        #[source]
        source: StoreError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

#[derive(Debug, Clone, Error)]
pub enum TriggerError {
    #[error("unknown batch type '{0}', expected 'hourly' or 'daily'")]
    UnknownBatchType(String),
}
