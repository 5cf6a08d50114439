use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use jiff::civil::Date;
use jiff::Timestamp;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tally_core::error::Result;
use tally_core::{
    keyspace, AccessFact, AccessRecorder, DailyAggregate, FactReader, LockToken, ShortCode,
    StatisticsStore, StoreError,
};
use tracing::{debug, trace, warn};
use typed_builder::TypedBuilder;

use crate::error::map_redis_error;
use crate::lock::RELEASE_SCRIPT;

const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_SCAN_COUNT: usize = 100;

const FIELD_ACCESS_COUNT: &str = "accessCount";
const FIELD_DATE: &str = "date";
const FIELD_PROCESSED_AT: &str = "processedAt";

/// Records a fact and, only if it is new, bumps the per-date counter and adds
/// the code to the per-date index. All three keys share one routing tag.
///
/// KEYS: fact, counter, index. ARGV: code, ttl seconds.
const RECORD_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[2]) then
  redis.call('INCR', KEYS[2])
  redis.call('EXPIRE', KEYS[2], ARGV[2])
  redis.call('SADD', KEYS[3], ARGV[1])
  redis.call('EXPIRE', KEYS[3], ARGV[2])
  return 1
end
return 0
"#;

#[derive(Debug, Clone, TypedBuilder)]
pub struct RedisStoreConfig {
    /// Lifetime of facts, per-date counters and per-date indexes.
    #[builder(default = DEFAULT_RETENTION)]
    pub retention: Duration,

    /// `COUNT` hint for `SCAN` when invalidating cached statistics.
    #[builder(default = DEFAULT_SCAN_COUNT)]
    pub scan_count: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Redis-backed fact index and statistics store.
///
/// Facts, counters, markers and aggregates live under the tagged key layout
/// of [`keyspace`]. The connection is a single-node `MultiplexedConnection`;
/// cached statistics invalidation scans only that node.
#[derive(Clone)]
pub struct RedisStatsStore {
    conn: MultiplexedConnection,
    config: RedisStoreConfig,
    record_script: redis::Script,
    release_script: redis::Script,
}

impl std::fmt::Debug for RedisStatsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStatsStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStatsStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self::with_config(conn, RedisStoreConfig::default())
    }

    pub fn with_config(conn: MultiplexedConnection, config: RedisStoreConfig) -> Self {
        Self {
            conn,
            config,
            record_script: redis::Script::new(RECORD_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    async fn members(&self, key: &str, operation: &str) -> Result<BTreeSet<ShortCode>> {
        let mut conn = self.conn.clone();
        let members: BTreeSet<String> = conn
            .smembers::<_, BTreeSet<String>>(key)
            .await
            .map_err(|e| map_redis_error(operation, e))?;

        Ok(members.into_iter().map(ShortCode::new_unchecked).collect())
    }

    /// `SET key value NX PX ttl`. Returns `true` if the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("failed to set marker in Redis", e))?;

        Ok(reply.is_some())
    }
}

/// Milliseconds for `PX`/`PEXPIRE`, clamped to `1..=i64::MAX`. Redis rejects
/// zero and a negative `PEXPIRE` deletes the key.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn invalid_field(key: &str, name: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidData(format!("aggregate '{key}' has invalid field '{name}': {err}"))
}

fn parse_aggregate(
    code: &ShortCode,
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<DailyAggregate> {
    let field = |name: &str| {
        fields.get(name).ok_or_else(|| {
            StoreError::InvalidData(format!("aggregate '{key}' is missing field '{name}'"))
        })
    };

    let access_count = field(FIELD_ACCESS_COUNT)?
        .parse::<u64>()
        .map_err(|e| invalid_field(key, FIELD_ACCESS_COUNT, e))?;
    let date = field(FIELD_DATE)?
        .parse::<Date>()
        .map_err(|e| invalid_field(key, FIELD_DATE, e))?;
    let processed_at = field(FIELD_PROCESSED_AT)?
        .parse::<Timestamp>()
        .map_err(|e| invalid_field(key, FIELD_PROCESSED_AT, e))?;

    Ok(DailyAggregate {
        code: code.clone(),
        date,
        access_count,
        processed_at,
    })
}

#[async_trait]
impl AccessRecorder for RedisStatsStore {
    async fn record(&self, fact: &AccessFact) -> Result<bool> {
        let fact_key = keyspace::fact_key(&fact.code, fact.date, fact.timestamp);
        trace!(code = %fact.code, date = %fact.date, "Recording access fact in Redis");

        let mut conn = self.conn.clone();
        let created: i64 = self
            .record_script
            .key(&fact_key)
            .key(keyspace::access_count_key(&fact.code, fact.date))
            .key(keyspace::code_index_key(fact.date))
            .arg(fact.code.as_str())
            .arg(ttl_secs(self.config.retention))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(code = %fact.code, error = %e, "Failed to record access fact");
                map_redis_error("failed to record access fact in Redis", e)
            })?;

        let created = created == 1;
        if !created {
            debug!(code = %fact.code, key = %fact_key, "Access fact already recorded");
        }
        Ok(created)
    }
}

#[async_trait]
impl FactReader for RedisStatsStore {
    async fn list_codes_for_date(&self, date: Date) -> Result<BTreeSet<ShortCode>> {
        let codes = self
            .members(
                &keyspace::code_index_key(date),
                "failed to read code index from Redis",
            )
            .await?;

        if codes.is_empty() {
            debug!(date = %date, "No access codes indexed for date");
        }
        Ok(codes)
    }

    async fn count_facts(&self, code: &ShortCode, date: Date) -> Result<u64> {
        let key = keyspace::access_count_key(code, date);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get::<_, Option<String>>(&key)
            .await
            .map_err(|e| map_redis_error("failed to read access count from Redis", e))?;

        match raw {
            None => Ok(0),
            Some(value) => match value.parse::<u64>() {
                Ok(count) => Ok(count),
                Err(e) => {
                    warn!(code = %code, key = %key, value = %value, error = %e, "Invalid access count, treating as zero");
                    Ok(0)
                }
            },
        }
    }
}

#[async_trait]
impl StatisticsStore for RedisStatsStore {
    async fn is_processed(&self, code: &ShortCode, date: Date) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists::<_, bool>(keyspace::processed_marker_key(code, date))
            .await
            .map_err(|e| map_redis_error("failed to check processed marker in Redis", e))
    }

    async fn try_mark_processing(
        &self,
        code: &ShortCode,
        date: Date,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let key = keyspace::processing_marker_key(code, date);
        let token = LockToken::generate(owner);
        let acquired = self.set_if_absent(&key, token.as_str(), ttl).await?;
        trace!(code = %code, date = %date, acquired, "Processing marker attempt");
        Ok(acquired.then_some(token))
    }

    async fn clear_processing(
        &self,
        code: &ShortCode,
        date: Date,
        token: &LockToken,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(keyspace::processing_marker_key(code, date))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("failed to clear processing marker in Redis", e))?;
        Ok(deleted == 1)
    }

    async fn save_daily_aggregate(&self, aggregate: &DailyAggregate, ttl: Duration) -> Result<()> {
        let key = keyspace::daily_aggregate_key(&aggregate.code, aggregate.date);
        let index = keyspace::daily_codes_key(aggregate.date);
        let fields = [
            (FIELD_ACCESS_COUNT, aggregate.access_count.to_string()),
            (FIELD_DATE, aggregate.date.to_string()),
            (FIELD_PROCESSED_AT, aggregate.processed_at.to_string()),
        ];
        let ttl_ms = ttl_millis(ttl);

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .pexpire(&key, ttl_ms)
            .ignore()
            .sadd(&index, aggregate.code.as_str())
            .ignore()
            .pexpire(&index, ttl_ms)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                warn!(code = %aggregate.code, error = %e, "Failed to save daily aggregate");
                map_redis_error("failed to save daily aggregate to Redis", e)
            })?;

        debug!(code = %aggregate.code, date = %aggregate.date, count = aggregate.access_count, "Saved daily aggregate");
        Ok(())
    }

    async fn daily_aggregate(&self, code: &ShortCode, date: Date) -> Result<Option<DailyAggregate>> {
        let key = keyspace::daily_aggregate_key(code, date);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall::<_, HashMap<String, String>>(&key)
            .await
            .map_err(|e| map_redis_error("failed to read daily aggregate from Redis", e))?;

        if fields.is_empty() {
            return Ok(None);
        }
        parse_aggregate(code, &key, &fields).map(Some)
    }

    async fn list_aggregated_codes(&self, date: Date) -> Result<BTreeSet<ShortCode>> {
        self.members(
            &keyspace::daily_codes_key(date),
            "failed to read aggregate index from Redis",
        )
        .await
    }

    async fn mark_processed(&self, code: &ShortCode, date: Date, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(keyspace::processed_marker_key(code, date))
            .arg("true")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("failed to set processed marker in Redis", e))
    }

    async fn invalidate_stats_cache(&self, code: &ShortCode) -> Result<usize> {
        let pattern = keyspace::stats_cache_pattern(code);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.config.scan_count)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("failed to scan cached statistics in Redis", e))?;

            // Deleted one by one: the matched keys share no routing tag.
            for key in keys {
                removed += conn
                    .del::<_, usize>(&key)
                    .await
                    .map_err(|e| map_redis_error("failed to delete cached statistics", e))?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(code = %code, removed, "Invalidated cached statistics");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_millis_stays_positive() {
        assert_eq!(ttl_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(u64::MAX)), i64::MAX);
        assert_eq!(ttl_millis(Duration::MAX), i64::MAX);
    }
}
