use crate::error::MetricsError;
use crate::shortcode::ShortCode;
use async_trait::async_trait;

/// Maintains the cumulative per-code access metrics.
///
/// Implemented by each backing store and by the composite that fans writes
/// out to all of them.
#[async_trait]
pub trait MetricsWriter: Send + Sync + 'static {
    /// Adds `delta` to the code's total and returns the new total.
    async fn increment_total(&self, code: &ShortCode, delta: u64) -> Result<u64, MetricsError>;

    /// Records the last access time as Unix milliseconds.
    async fn update_last_access_time(
        &self,
        code: &ShortCode,
        timestamp_millis: i64,
    ) -> Result<(), MetricsError>;
}
