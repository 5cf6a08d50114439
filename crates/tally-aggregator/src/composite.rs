use async_trait::async_trait;
use tally_core::{MetricsError, MetricsWriter, ShortCode};
use tracing::{debug, error, trace, warn};

/// A [`MetricsWriter`] that writes every update to two stores.
///
/// `D` is the durable store (the value of record) and `C` the cache store.
/// Both writes are always attempted:
///
/// - both succeed: the durable result is returned
/// - one fails: the other result is returned and the partial write is logged
/// - both fail: [`MetricsError::BothFailed`] carries both causes
///
/// The two copies may drift after a partial write; nothing reconciles them
/// here.
#[derive(Debug, Clone)]
pub struct CompositeMetricsWriter<D, C> {
    durable: D,
    cache: C,
}

impl<D, C> CompositeMetricsWriter<D, C> {
    pub fn new(durable: D, cache: C) -> Self {
        Self { durable, cache }
    }

    /// Returns a reference to the durable writer.
    pub fn durable(&self) -> &D {
        &self.durable
    }

    /// Returns a reference to the cache writer.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Consumes the composite and returns the inner writers.
    pub fn into_inner(self) -> (D, C) {
        (self.durable, self.cache)
    }
}

fn both_failed(code: &ShortCode, durable: MetricsError, cache: MetricsError) -> MetricsError {
    MetricsError::BothFailed {
        code: code.to_string(),
        durable: Box::new(durable),
        cache: Box::new(cache),
    }
}

#[async_trait]
impl<D, C> MetricsWriter for CompositeMetricsWriter<D, C>
where
    D: MetricsWriter,
    C: MetricsWriter,
{
    async fn increment_total(&self, code: &ShortCode, delta: u64) -> Result<u64, MetricsError> {
        trace!(code = %code, delta, "Incrementing total in durable and cache stores");

        let durable = self.durable.increment_total(code, delta).await;
        let cache = self.cache.increment_total(code, delta).await;

        match (durable, cache) {
            (Ok(total), Ok(cached)) => {
                debug!(code = %code, total, cached, "Incremented total in both stores");
                Ok(total)
            }
            (Ok(total), Err(e)) => {
                warn!(code = %code, error = %e, "Partial write: cache increment failed");
                Ok(total)
            }
            (Err(e), Ok(cached)) => {
                warn!(code = %code, error = %e, "Partial write: durable increment failed, returning cache total");
                Ok(cached)
            }
            (Err(durable), Err(cache)) => {
                error!(code = %code, durable = %durable, cache = %cache, "Both total increments failed");
                Err(both_failed(code, durable, cache))
            }
        }
    }

    async fn update_last_access_time(
        &self,
        code: &ShortCode,
        timestamp_millis: i64,
    ) -> Result<(), MetricsError> {
        let durable = self
            .durable
            .update_last_access_time(code, timestamp_millis)
            .await;
        let cache = self
            .cache
            .update_last_access_time(code, timestamp_millis)
            .await;

        match (durable, cache) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                warn!(code = %code, error = %e, "Partial write: cache last access update failed");
                Ok(())
            }
            (Err(e), Ok(())) => {
                warn!(code = %code, error = %e, "Partial write: durable last access update failed");
                Ok(())
            }
            (Err(durable), Err(cache)) => {
                error!(code = %code, durable = %durable, cache = %cache, "Both last access updates failed");
                Err(both_failed(code, durable, cache))
            }
        }
    }
}
