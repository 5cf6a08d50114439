//! Per-date aggregation of access facts into daily aggregates and totals.
//!
//! A run walks the date's code index and handles every (code, date) pair on
//! its own. Two gates keep a pair from being counted twice:
//!
//! 1. the processed marker, set only after every write of the pair succeeded;
//! 2. the processing marker, an atomic short-lived claim held while writing.
//!
//! A failure in one pair is logged and never aborts the rest of the run.

use std::time::Duration;

use async_trait::async_trait;
use jiff::civil::Date;
use jiff::Timestamp;
use tally_core::{DailyAggregate, MetricsWriter, ShortCode, StatisticsStore};
use tracing::{debug, error, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::coordinator::InstanceId;
use crate::error::AggregationError;

const DEFAULT_PROCESSING_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_AGGREGATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_PROCESSED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, TypedBuilder)]
pub struct AggregationConfig {
    /// Owner recorded in this worker's processing markers.
    #[builder(default = InstanceId::detect())]
    pub instance_id: InstanceId,

    /// Upper bound on how long a crashed worker can block a pair.
    #[builder(default = DEFAULT_PROCESSING_TTL)]
    pub processing_ttl: Duration,

    #[builder(default = DEFAULT_AGGREGATE_TTL)]
    pub aggregate_ttl: Duration,

    #[builder(default = DEFAULT_PROCESSED_TTL)]
    pub processed_ttl: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Tally of one run, by pair outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationReport {
    /// Codes listed in the date's index.
    pub candidates: usize,
    /// Pairs whose writes all completed in this run.
    pub processed: usize,
    /// Pairs skipped because an earlier run completed them.
    pub already_processed: usize,
    /// Pairs skipped because another worker holds the processing marker.
    pub in_flight: usize,
    /// Codes with no facts to aggregate.
    pub empty: usize,
    /// Pairs abandoned after an error; retried by the next run.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOutcome {
    Processed,
    AlreadyProcessed,
    InFlight,
    Failed,
}

/// Anything the job coordinator can run for a date.
#[async_trait]
pub trait StatisticsAggregator: Send + Sync + 'static {
    /// Aggregates `date` and returns the number of pairs processed.
    async fn aggregate(&self, date: Date) -> Result<usize, AggregationError>;
}

/// Turns a date's access facts into daily aggregates and cumulative totals.
#[derive(Debug, Clone)]
pub struct AggregationEngine<S, M> {
    store: S,
    metrics: M,
    config: AggregationConfig,
}

impl<S, M> AggregationEngine<S, M> {
    pub fn new(store: S, metrics: M, config: AggregationConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> &M {
        &self.metrics
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }
}

impl<S, M> AggregationEngine<S, M>
where
    S: StatisticsStore,
    M: MetricsWriter,
{
    /// Aggregates every code indexed for `date`.
    ///
    /// Returns the number of pairs fully processed by this call. Only a
    /// failure to read the index fails the whole run.
    pub async fn aggregate(&self, date: Date) -> Result<usize, AggregationError> {
        Ok(self.aggregate_with_report(date).await?.processed)
    }

    /// Like [`aggregate`](Self::aggregate), returning the full tally.
    pub async fn aggregate_with_report(
        &self,
        date: Date,
    ) -> Result<AggregationReport, AggregationError> {
        let codes = self
            .store
            .list_codes_for_date(date)
            .await
            .map_err(|source| AggregationError::Index { date, source })?;

        let mut report = AggregationReport {
            candidates: codes.len(),
            ..AggregationReport::default()
        };
        if codes.is_empty() {
            info!(date = %date, "No codes to aggregate");
            return Ok(report);
        }
        info!(date = %date, codes = codes.len(), "Starting aggregation");

        let mut counts = Vec::with_capacity(codes.len());
        for code in codes {
            match self.store.count_facts(&code, date).await {
                Ok(0) => {
                    trace!(code = %code, "No facts to aggregate");
                    report.empty += 1;
                }
                Ok(count) => counts.push((code, count)),
                Err(e) => {
                    warn!(code = %code, date = %date, error = %e, "Failed to count facts, skipping code");
                    report.failed += 1;
                }
            }
        }

        for (code, count) in counts {
            match self.aggregate_pair(&code, date, count).await {
                PairOutcome::Processed => report.processed += 1,
                PairOutcome::AlreadyProcessed => report.already_processed += 1,
                PairOutcome::InFlight => report.in_flight += 1,
                PairOutcome::Failed => report.failed += 1,
            }
        }

        info!(
            date = %date,
            processed = report.processed,
            already_processed = report.already_processed,
            in_flight = report.in_flight,
            failed = report.failed,
            "Finished aggregation"
        );
        Ok(report)
    }

    async fn aggregate_pair(&self, code: &ShortCode, date: Date, count: u64) -> PairOutcome {
        // A marker lookup error skips the pair; guessing could double count.
        match self.store.is_processed(code, date).await {
            Ok(true) => {
                debug!(code = %code, date = %date, "Already processed");
                return PairOutcome::AlreadyProcessed;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(code = %code, date = %date, error = %e, "Failed to check processed marker");
                return PairOutcome::Failed;
            }
        }

        let token = match self
            .store
            .try_mark_processing(
                code,
                date,
                self.config.instance_id.as_str(),
                self.config.processing_ttl,
            )
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(code = %code, date = %date, "Another worker is processing this pair");
                return PairOutcome::InFlight;
            }
            Err(e) => {
                warn!(code = %code, date = %date, error = %e, "Failed to set processing marker");
                return PairOutcome::Failed;
            }
        };

        // Checked again under the claim: another worker may have completed
        // the pair and released its marker since the first check.
        let outcome = match self.store.is_processed(code, date).await {
            Ok(true) => {
                debug!(code = %code, date = %date, "Processed while claiming");
                PairOutcome::AlreadyProcessed
            }
            Ok(false) => match self.write_pair(code, date, count).await {
                Ok(()) => PairOutcome::Processed,
                Err(e) => {
                    error!(code = %code, date = %date, error = %e, "Failed to aggregate pair");
                    PairOutcome::Failed
                }
            },
            Err(e) => {
                warn!(code = %code, date = %date, error = %e, "Failed to recheck processed marker");
                PairOutcome::Failed
            }
        };

        match self.store.clear_processing(code, date, &token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(code = %code, date = %date, "Processing marker expired before it was cleared")
            }
            Err(e) => {
                warn!(code = %code, date = %date, error = %e, "Failed to clear processing marker; it will expire")
            }
        }

        outcome
    }

    async fn write_pair(
        &self,
        code: &ShortCode,
        date: Date,
        count: u64,
    ) -> Result<(), AggregationError> {
        let processed_at = Timestamp::now();
        let aggregate = DailyAggregate {
            code: code.clone(),
            date,
            access_count: count,
            processed_at,
        };

        self.store
            .save_daily_aggregate(&aggregate, self.config.aggregate_ttl)
            .await?;

        let total = self.metrics.increment_total(code, count).await?;

        // The increment above is committed; failing here would repeat it.
        if let Err(e) = self
            .metrics
            .update_last_access_time(code, processed_at.as_millisecond())
            .await
        {
            warn!(code = %code, error = %e, "Failed to update last access time");
        }

        self.store
            .mark_processed(code, date, self.config.processed_ttl)
            .await?;

        match self.store.invalidate_stats_cache(code).await {
            Ok(removed) => trace!(code = %code, removed, "Invalidated cached statistics"),
            Err(e) => warn!(code = %code, error = %e, "Failed to invalidate cached statistics"),
        }

        debug!(code = %code, date = %date, count, total, "Aggregated pair");
        Ok(())
    }
}

#[async_trait]
impl<S, M> StatisticsAggregator for AggregationEngine<S, M>
where
    S: StatisticsStore,
    M: MetricsWriter,
{
    async fn aggregate(&self, date: Date) -> Result<usize, AggregationError> {
        AggregationEngine::aggregate(self, date).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use jiff::civil::date;
    use tally_cache::InMemoryStatsStore;
    use tally_core::error::Result as StoreResult;
    use tally_core::{
        keyspace, AccessFact, AccessRecorder, FactReader, LockToken, MetricsError, StoreError,
    };
    use tally_storage::InMemoryMetricsWriter;
    use tokio::sync::Notify;

    use crate::CompositeMetricsWriter;

    // 2024-01-01T00:00:00Z
    const JAN_1: i64 = 1_704_067_200_000;

    fn code(s: &str) -> ShortCode {
        ShortCode::new_unchecked(s)
    }

    async fn record(store: &InMemoryStatsStore, c: &str, n: i64) {
        for i in 0..n {
            let ts = Timestamp::from_millisecond(JAN_1 + i).unwrap();
            store.record(&AccessFact::new(code(c), ts)).await.unwrap();
        }
    }

    /// Store with three facts for `aaa` and one for `bbb` on 2024-01-01.
    async fn seeded_store() -> InMemoryStatsStore {
        let store = InMemoryStatsStore::new();
        record(&store, "aaa", 3).await;
        record(&store, "bbb", 1).await;
        store
    }

    fn engine<M: MetricsWriter>(
        store: InMemoryStatsStore,
        metrics: M,
    ) -> AggregationEngine<InMemoryStatsStore, M> {
        AggregationEngine::new(store, metrics, AggregationConfig::default())
    }

    /// Metrics writer that can be switched between failing and healthy.
    #[derive(Debug, Clone, Default)]
    struct SwitchableWriter {
        inner: InMemoryMetricsWriter,
        fail_increment: Arc<AtomicBool>,
        fail_last_access: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MetricsWriter for SwitchableWriter {
        async fn increment_total(&self, code: &ShortCode, delta: u64) -> Result<u64, MetricsError> {
            if self.fail_increment.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("increment down".into()).into());
            }
            self.inner.increment_total(code, delta).await
        }

        async fn update_last_access_time(&self, code: &ShortCode, ts: i64) -> Result<(), MetricsError> {
            if self.fail_last_access.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("last access down".into()).into());
            }
            self.inner.update_last_access_time(code, ts).await
        }
    }

    /// Store wrapper that injects read failures.
    #[derive(Debug, Clone, Default)]
    struct FaultyStore {
        inner: InMemoryStatsStore,
        fail_index: bool,
        fail_count_for: Option<ShortCode>,
        fail_processed_check_for: Option<ShortCode>,
        gate: Option<Arc<Gate>>,
    }

    /// Parks the first processed-marker check until released.
    #[derive(Debug, Default)]
    struct Gate {
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl FactReader for FaultyStore {
        async fn list_codes_for_date(&self, date: Date) -> StoreResult<BTreeSet<ShortCode>> {
            if self.fail_index {
                return Err(StoreError::Unavailable("index down".into()));
            }
            self.inner.list_codes_for_date(date).await
        }

        async fn count_facts(&self, code: &ShortCode, date: Date) -> StoreResult<u64> {
            if self.fail_count_for.as_ref() == Some(code) {
                return Err(StoreError::Timeout("count timed out".into()));
            }
            self.inner.count_facts(code, date).await
        }
    }

    #[async_trait]
    impl StatisticsStore for FaultyStore {
        async fn is_processed(&self, code: &ShortCode, date: Date) -> StoreResult<bool> {
            if self.fail_processed_check_for.as_ref() == Some(code) {
                return Err(StoreError::Timeout("marker timed out".into()));
            }
            let processed = self.inner.is_processed(code, date).await;
            if let Some(gate) = &self.gate {
                if gate.armed.swap(false, Ordering::SeqCst) {
                    gate.reached.notify_one();
                    gate.release.notified().await;
                }
            }
            processed
        }

        async fn try_mark_processing(
            &self,
            code: &ShortCode,
            date: Date,
            owner: &str,
            ttl: Duration,
        ) -> StoreResult<Option<LockToken>> {
            self.inner.try_mark_processing(code, date, owner, ttl).await
        }

        async fn clear_processing(&self, code: &ShortCode, date: Date, token: &LockToken) -> StoreResult<bool> {
            self.inner.clear_processing(code, date, token).await
        }

        async fn save_daily_aggregate(&self, aggregate: &DailyAggregate, ttl: Duration) -> StoreResult<()> {
            self.inner.save_daily_aggregate(aggregate, ttl).await
        }

        async fn daily_aggregate(&self, code: &ShortCode, date: Date) -> StoreResult<Option<DailyAggregate>> {
            self.inner.daily_aggregate(code, date).await
        }

        async fn list_aggregated_codes(&self, date: Date) -> StoreResult<BTreeSet<ShortCode>> {
            self.inner.list_aggregated_codes(date).await
        }

        async fn mark_processed(&self, code: &ShortCode, date: Date, ttl: Duration) -> StoreResult<()> {
            self.inner.mark_processed(code, date, ttl).await
        }

        async fn invalidate_stats_cache(&self, code: &ShortCode) -> StoreResult<usize> {
            self.inner.invalidate_stats_cache(code).await
        }
    }

    #[tokio::test]
    async fn aggregates_each_code_of_the_day() {
        let store = seeded_store().await;
        let metrics = InMemoryMetricsWriter::new();
        let engine = engine(store.clone(), metrics.clone());
        let d = date(2024, 1, 1);

        assert_eq!(engine.aggregate(d).await.unwrap(), 2);

        let a = store.daily_aggregate(&code("aaa"), d).await.unwrap().unwrap();
        let b = store.daily_aggregate(&code("bbb"), d).await.unwrap().unwrap();
        assert_eq!((a.access_count, a.date), (3, d));
        assert_eq!((b.access_count, b.date), (1, d));

        assert_eq!(metrics.total(&code("aaa")), 3);
        assert_eq!(metrics.total(&code("bbb")), 1);
        assert!(metrics.last_access(&code("aaa")).is_some());

        assert!(store.is_processed(&code("aaa"), d).await.unwrap());
        assert!(store.is_processed(&code("bbb"), d).await.unwrap());
        assert!(!store.contains_key(&keyspace::processing_marker_key(&code("aaa"), d)));
        assert_eq!(
            store.list_aggregated_codes(d).await.unwrap(),
            BTreeSet::from([code("aaa"), code("bbb")])
        );
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let store = seeded_store().await;
        let metrics = InMemoryMetricsWriter::new();
        let engine = engine(store, metrics.clone());
        let d = date(2024, 1, 1);

        assert_eq!(engine.aggregate(d).await.unwrap(), 2);
        let report = engine.aggregate_with_report(d).await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.already_processed, 2);
        assert_eq!(metrics.total(&code("aaa")), 3);
        assert_eq!(metrics.total(&code("bbb")), 1);
    }

    #[tokio::test]
    async fn empty_date_has_no_side_effects() {
        let store = InMemoryStatsStore::new();
        let metrics = InMemoryMetricsWriter::new();
        let engine = engine(store.clone(), metrics.clone());

        let report = engine.aggregate_with_report(date(2024, 1, 2)).await.unwrap();

        assert_eq!(report, AggregationReport::default());
        assert!(!store.contains_key(&keyspace::daily_codes_key(date(2024, 1, 2))));
    }

    #[tokio::test]
    async fn concurrent_engines_never_double_count() {
        let store = seeded_store().await;
        let metrics = InMemoryMetricsWriter::new();
        let d = date(2024, 1, 1);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine(store.clone(), metrics.clone());
                tokio::spawn(async move { engine.aggregate(d).await.unwrap() })
            })
            .collect();

        let mut processed = 0;
        for worker in workers {
            processed += worker.await.unwrap();
        }

        assert_eq!(processed, 2);
        assert_eq!(metrics.total(&code("aaa")), 3);
        assert_eq!(metrics.total(&code("bbb")), 1);
    }

    #[tokio::test]
    async fn pair_completed_between_check_and_claim_is_not_rewritten() {
        let store = InMemoryStatsStore::new();
        record(&store, "aaa", 3).await;
        let metrics = InMemoryMetricsWriter::new();
        let d = date(2024, 1, 1);
        let gate = Arc::new(Gate {
            armed: AtomicBool::new(true),
            ..Gate::default()
        });

        let paused = AggregationEngine::new(
            FaultyStore {
                inner: store.clone(),
                gate: Some(gate.clone()),
                ..FaultyStore::default()
            },
            metrics.clone(),
            AggregationConfig::default(),
        );
        let first = tokio::spawn(async move { paused.aggregate_with_report(d).await.unwrap() });
        gate.reached.notified().await;

        // The first worker has seen "not processed"; a second one finishes the pair.
        assert_eq!(engine(store.clone(), metrics.clone()).aggregate(d).await.unwrap(), 1);
        assert!(!store.contains_key(&keyspace::processing_marker_key(&code("aaa"), d)));

        gate.release.notify_one();
        let report = first.await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.already_processed, 1);
        assert_eq!(metrics.total(&code("aaa")), 3);
        assert_eq!(
            store.daily_aggregate(&code("aaa"), d).await.unwrap().unwrap().access_count,
            3
        );
        assert!(!store.contains_key(&keyspace::processing_marker_key(&code("aaa"), d)));
    }

    #[tokio::test]
    async fn aggregator_trait_runs_the_engine() {
        let metrics = InMemoryMetricsWriter::new();
        let aggregator: Box<dyn StatisticsAggregator> =
            Box::new(engine(seeded_store().await, metrics.clone()));

        assert_eq!(aggregator.aggregate(date(2024, 1, 1)).await.unwrap(), 2);
        assert_eq!(metrics.total(&code("aaa")), 3);
    }

    #[tokio::test]
    async fn pair_claimed_elsewhere_is_left_alone() {
        let store = seeded_store().await;
        let metrics = InMemoryMetricsWriter::new();
        let d = date(2024, 1, 1);
        assert!(store
            .try_mark_processing(&code("aaa"), d, "node-b", Duration::from_secs(600))
            .await
            .unwrap()
            .is_some());

        let report = engine(store.clone(), metrics.clone())
            .aggregate_with_report(d)
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.in_flight, 1);
        assert_eq!(metrics.total(&code("aaa")), 0);
        assert!(store.contains_key(&keyspace::processing_marker_key(&code("aaa"), d)));
    }

    #[tokio::test]
    async fn failed_pair_is_retried_by_next_run() {
        let store = seeded_store().await;
        let metrics = SwitchableWriter::default();
        metrics.fail_increment.store(true, Ordering::SeqCst);
        let engine = engine(store.clone(), metrics.clone());
        let d = date(2024, 1, 1);

        let report = engine.aggregate_with_report(d).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 2);
        assert!(!store.is_processed(&code("aaa"), d).await.unwrap());
        assert!(!store.contains_key(&keyspace::processing_marker_key(&code("aaa"), d)));

        metrics.fail_increment.store(false, Ordering::SeqCst);
        assert_eq!(engine.aggregate(d).await.unwrap(), 2);
        assert_eq!(metrics.inner.total(&code("aaa")), 3);
    }

    #[tokio::test]
    async fn last_access_failure_does_not_fail_the_pair() {
        let store = seeded_store().await;
        let metrics = SwitchableWriter::default();
        metrics.fail_last_access.store(true, Ordering::SeqCst);
        let d = date(2024, 1, 1);

        assert_eq!(engine(store.clone(), metrics.clone()).aggregate(d).await.unwrap(), 2);
        assert!(store.is_processed(&code("aaa"), d).await.unwrap());
        assert_eq!(metrics.inner.last_access(&code("aaa")), None);
    }

    #[tokio::test]
    async fn composite_with_one_side_down_still_completes() {
        let store = seeded_store().await;
        let durable = InMemoryMetricsWriter::new();
        let cache = SwitchableWriter::default();
        cache.fail_increment.store(true, Ordering::SeqCst);
        let composite = CompositeMetricsWriter::new(durable.clone(), cache);

        assert_eq!(
            engine(store, composite).aggregate(date(2024, 1, 1)).await.unwrap(),
            2
        );
        assert_eq!(durable.total(&code("aaa")), 3);
    }

    #[tokio::test]
    async fn aggregation_invalidates_cached_statistics() {
        let store = seeded_store().await;
        store.insert_value("stats:aaa:summary", "{}", None);
        store.insert_value("stats:zzz:summary", "{}", None);

        engine(store.clone(), InMemoryMetricsWriter::new())
            .aggregate(date(2024, 1, 1))
            .await
            .unwrap();

        assert!(!store.contains_key("stats:aaa:summary"));
        assert!(store.contains_key("stats:zzz:summary"));
    }

    #[tokio::test]
    async fn index_failure_fails_the_run() {
        let store = FaultyStore {
            inner: seeded_store().await,
            fail_index: true,
            ..FaultyStore::default()
        };
        let engine = AggregationEngine::new(store, InMemoryMetricsWriter::new(), AggregationConfig::default());

        let err = engine.aggregate(date(2024, 1, 1)).await.unwrap_err();
        assert!(matches!(err, AggregationError::Index { .. }));
    }

    #[tokio::test]
    async fn per_code_read_failures_skip_only_that_code() {
        let store = FaultyStore {
            inner: seeded_store().await,
            fail_count_for: Some(code("aaa")),
            ..FaultyStore::default()
        };
        let metrics = InMemoryMetricsWriter::new();
        let engine = AggregationEngine::new(store, metrics.clone(), AggregationConfig::default());

        let report = engine.aggregate_with_report(date(2024, 1, 1)).await.unwrap();
        assert_eq!((report.processed, report.failed), (1, 1));
        assert_eq!(metrics.total(&code("aaa")), 0);
        assert_eq!(metrics.total(&code("bbb")), 1);
    }

    #[tokio::test]
    async fn marker_check_failure_skips_the_pair() {
        let store = FaultyStore {
            inner: seeded_store().await,
            fail_processed_check_for: Some(code("bbb")),
            ..FaultyStore::default()
        };
        let metrics = InMemoryMetricsWriter::new();
        let engine = AggregationEngine::new(store, metrics.clone(), AggregationConfig::default());

        let report = engine.aggregate_with_report(date(2024, 1, 1)).await.unwrap();
        assert_eq!((report.processed, report.failed), (1, 1));
        assert_eq!(metrics.total(&code("bbb")), 0);
    }
}
