use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tally_core::{keyspace, today_utc, MetricsError, MetricsWriter, ShortCode};
use tracing::{debug, trace, warn};

use crate::error::map_redis_error;
use crate::redis::RedisStoreConfig;

/// Cache-side copy of the per-code totals.
///
/// Totals are kept in per-day buckets under today's routing tag and expire
/// with the retention window, so this copy is never the value of record.
#[derive(Debug, Clone)]
pub struct RedisMetricsWriter {
    conn: MultiplexedConnection,
    retention: Duration,
}

impl RedisMetricsWriter {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self::with_config(conn, &RedisStoreConfig::default())
    }

    pub fn with_config(conn: MultiplexedConnection, config: &RedisStoreConfig) -> Self {
        Self {
            conn,
            retention: config.retention,
        }
    }

    fn retention_millis(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX).max(1)
    }
}

#[async_trait]
impl MetricsWriter for RedisMetricsWriter {
    async fn increment_total(&self, code: &ShortCode, delta: u64) -> Result<u64, MetricsError> {
        let key = keyspace::total_counter_key(code, today_utc());
        trace!(code = %code, delta, "Incrementing total in Redis");

        let mut conn = self.conn.clone();
        let (total,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, delta)
            .pexpire(&key, self.retention_millis())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(code = %code, error = %e, "Failed to increment total in Redis");
                map_redis_error("failed to increment total in Redis", e)
            })?;

        debug!(code = %code, total, "Incremented total in Redis");
        Ok(total)
    }

    async fn update_last_access_time(
        &self,
        code: &ShortCode,
        timestamp_millis: i64,
    ) -> Result<(), MetricsError> {
        let key = keyspace::last_access_key(code, today_utc());

        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(timestamp_millis)
            .arg("PX")
            .arg(self.retention_millis())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                warn!(code = %code, error = %e, "Failed to update last access time in Redis");
                map_redis_error("failed to update last access time in Redis", e)
            })?;

        trace!(code = %code, timestamp_millis, "Updated last access time in Redis");
        Ok(())
    }
}
