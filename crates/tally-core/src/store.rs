use crate::error::Result;
use crate::lock::LockToken;
use crate::model::{AccessFact, DailyAggregate};
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use jiff::civil::Date;
use std::collections::BTreeSet;
use std::time::Duration;

/// Write side of the fact index.
///
/// Called once per redirect. A fact, its per-date counter and the per-date
/// code index are written together so that a code is listed for a date
/// exactly when at least one fact exists for it.
#[async_trait]
pub trait AccessRecorder: Send + Sync + 'static {
    /// Records `fact` if it has not been recorded before.
    ///
    /// Returns `true` if the fact was new. Replaying the same fact leaves
    /// counters untouched and returns `false`.
    async fn record(&self, fact: &AccessFact) -> Result<bool>;
}

/// Read side of the fact index.
///
/// Implementations enumerate codes only through the per-date index and never
/// scan the whole key space.
#[async_trait]
pub trait FactReader: Send + Sync + 'static {
    /// Returns every code with at least one fact on `date`. Empty if none.
    async fn list_codes_for_date(&self, date: Date) -> Result<BTreeSet<ShortCode>>;

    /// Returns the number of facts for `code` on `date`.
    ///
    /// Missing or unparsable counters count as zero.
    async fn count_facts(&self, code: &ShortCode, date: Date) -> Result<u64>;
}

/// Markers, daily aggregates and derived-cache maintenance used by the
/// aggregation engine.
#[async_trait]
pub trait StatisticsStore: FactReader {
    /// Whether the (code, date) pair has already been aggregated.
    async fn is_processed(&self, code: &ShortCode, date: Date) -> Result<bool>;

    /// Atomically claims the pair for aggregation.
    ///
    /// Returns the claim token, or `None` if another worker holds a live
    /// processing marker. The token names `owner` and is unique per claim.
    async fn try_mark_processing(
        &self,
        code: &ShortCode,
        date: Date,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>>;

    /// Removes the processing marker if it still holds `token`.
    ///
    /// Returns `false` if the marker expired or now belongs to another claim,
    /// which is left in place.
    async fn clear_processing(&self, code: &ShortCode, date: Date, token: &LockToken)
        -> Result<bool>;

    /// Stores the aggregate, replacing any previous one for the pair, and adds
    /// the code to the date's aggregate index.
    async fn save_daily_aggregate(&self, aggregate: &DailyAggregate, ttl: Duration)
        -> Result<()>;

    /// Reads the aggregate back. Returns `Ok(None)` if it is absent or expired.
    async fn daily_aggregate(&self, code: &ShortCode, date: Date)
        -> Result<Option<DailyAggregate>>;

    /// Returns every code with a stored aggregate on `date`.
    async fn list_aggregated_codes(&self, date: Date) -> Result<BTreeSet<ShortCode>>;

    async fn mark_processed(&self, code: &ShortCode, date: Date, ttl: Duration) -> Result<()>;

    /// Drops every cached statistics entry derived from `code`.
    ///
    /// Returns the number of entries removed.
    async fn invalidate_stats_cache(&self, code: &ShortCode) -> Result<usize>;
}
