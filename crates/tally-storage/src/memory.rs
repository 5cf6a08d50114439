use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tally_core::{MetricsError, MetricsWriter, ShortCode};

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    total: u64,
    last_access_millis: Option<i64>,
}

/// In-memory [`MetricsWriter`] backed by a `DashMap`.
///
/// Clones share the same map. Serves as either side of a composite writer in
/// tests and single-node runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricsWriter {
    totals: Arc<DashMap<String, Totals>>,
}

impl InMemoryMetricsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current total for `code`; zero if it was never incremented.
    pub fn total(&self, code: &ShortCode) -> u64 {
        self.totals
            .get(code.as_str())
            .map_or(0, |totals| totals.total)
    }

    pub fn last_access(&self, code: &ShortCode) -> Option<i64> {
        self.totals
            .get(code.as_str())
            .and_then(|totals| totals.last_access_millis)
    }
}

#[async_trait]
impl MetricsWriter for InMemoryMetricsWriter {
    async fn increment_total(&self, code: &ShortCode, delta: u64) -> Result<u64, MetricsError> {
        let mut totals = self.totals.entry(code.as_str().to_owned()).or_default();
        totals.total += delta;
        Ok(totals.total)
    }

    async fn update_last_access_time(
        &self,
        code: &ShortCode,
        timestamp_millis: i64,
    ) -> Result<(), MetricsError> {
        self.totals
            .entry(code.as_str().to_owned())
            .or_default()
            .last_access_millis = Some(timestamp_millis);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn totals_accumulate_per_code() {
        let writer = InMemoryMetricsWriter::new();
        let a = ShortCode::new_unchecked("aaa");
        let b = ShortCode::new_unchecked("bbb");

        assert_eq!(writer.increment_total(&a, 3).await.unwrap(), 3);
        assert_eq!(writer.increment_total(&a, 4).await.unwrap(), 7);
        assert_eq!(writer.increment_total(&b, 1).await.unwrap(), 1);
        assert_eq!(writer.total(&a), 7);
        assert_eq!(writer.total(&ShortCode::new_unchecked("ccc")), 0);
    }

    #[tokio::test]
    async fn last_access_is_overwritten() {
        let writer = InMemoryMetricsWriter::new();
        let shared = writer.clone();
        let a = ShortCode::new_unchecked("aaa");

        writer.update_last_access_time(&a, 10).await.unwrap();
        shared.update_last_access_time(&a, 20).await.unwrap();

        assert_eq!(writer.last_access(&a), Some(20));
        assert_eq!(writer.total(&a), 0);
    }
}
