use thiserror::Error;

/// Result type for fact, marker and lock operations against a backing store.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out: {0}")]
    Timeout(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store operation failed: {0}")]
    Operation(String),
}

/// Errors raised by a [`MetricsWriter`](crate::MetricsWriter).
#[derive(Debug, Clone, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Both sides of a composite write failed; carries each side's cause.
    #[error("durable and cache writes both failed for code '{code}': durable: {durable}; cache: {cache}")]
    BothFailed {
        code: String,
        durable: Box<MetricsError>,
        cache: Box<MetricsError>,
    },
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
}
