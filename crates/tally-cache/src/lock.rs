use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tally_core::error::Result;
use tally_core::{DistributedLock, LockToken};
use tracing::{debug, trace, warn};

use crate::error::map_redis_error;

/// Deletes the key only while it still holds the caller's token. Shared by
/// the batch lock and the per-pair processing marker.
pub(crate) const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// [`DistributedLock`] over a single Redis key per lock.
#[derive(Clone)]
pub struct RedisLock {
    conn: MultiplexedConnection,
    release_script: redis::Script,
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock").finish_non_exhaustive()
    }
}

impl RedisLock {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        if key.trim().is_empty() {
            warn!("Refusing to acquire lock with a blank key");
            return Ok(None);
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms == 0 {
            warn!(key = %key, "Refusing to acquire lock with a zero TTL");
            return Ok(None);
        }

        let token = LockToken::generate(owner);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to acquire lock");
                map_redis_error("failed to acquire lock in Redis", e)
            })?;

        if reply.is_some() {
            debug!(key = %key, token = %token, "Lock acquired");
            Ok(Some(token))
        } else {
            trace!(key = %key, "Lock is held elsewhere");
            Ok(None)
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to release lock");
                map_redis_error("failed to release lock in Redis", e)
            })?;

        if deleted == 1 {
            debug!(key = %key, "Lock released");
            Ok(true)
        } else {
            warn!(key = %key, token = %token, "Lock was not released; it expired or belongs to another holder");
            Ok(false)
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| map_redis_error("failed to read lock holder from Redis", e))
    }
}
