use async_trait::async_trait;
use jiff::Timestamp;
use sqlx::{MySqlPool, Row};
use tally_core::error::Result;
use tally_core::{MetricsError, MetricsWriter, ShortCode};
use tracing::{debug, trace, warn};

use crate::error::map_sqlx_error;

const SCHEMA: &str = include_str!("../ddl/mysql/url_statistics.sql");

/// MySQL copy of the per-code totals; the value of record.
///
/// One row per short code in `url_statistics`. Timestamps are stored as Unix
/// milliseconds.
#[derive(Debug, Clone)]
pub struct MySqlMetricsWriter {
    pool: MySqlPool,
}

impl MySqlMetricsWriter {
    /// Creates a writer from an existing MySQL connection pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Creates a writer by opening a new MySQL connection pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPool::connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }

    /// Creates `url_statistics` if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Reads the stored total. Returns `None` if the code has no row yet.
    pub async fn total_access_count(&self, code: &ShortCode) -> Result<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT total_access_count
            FROM url_statistics
            WHERE short_code = ?
            "#,
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| row.try_get::<u64, _>("total_access_count"))
            .transpose()
            .map_err(map_sqlx_error)
    }

    /// Reads the stored last access time as Unix milliseconds.
    pub async fn last_access_time(&self, code: &ShortCode) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT last_accessed_at
            FROM url_statistics
            WHERE short_code = ?
            "#,
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        row.try_get::<Option<i64>, _>("last_accessed_at")
            .map_err(map_sqlx_error)
    }
}

fn now_unix_millis() -> i64 {
    Timestamp::now().as_millisecond()
}

#[async_trait]
impl MetricsWriter for MySqlMetricsWriter {
    async fn increment_total(&self, code: &ShortCode, delta: u64) -> std::result::Result<u64, MetricsError> {
        let now = now_unix_millis();
        trace!(code = %code, delta, "Incrementing total in MySQL");

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO url_statistics
                (short_code, total_access_count, last_accessed_at, created_at, updated_at)
            VALUES (?, ?, NULL, ?, ?) AS incoming
            ON DUPLICATE KEY UPDATE
                total_access_count = url_statistics.total_access_count + incoming.total_access_count,
                updated_at = incoming.updated_at
            "#,
        )
        .bind(code.as_str())
        .bind(delta)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            warn!(code = %code, error = %e, "Failed to upsert total in MySQL");
            map_sqlx_error(e)
        })?;

        let total: u64 = sqlx::query(
            r#"
            SELECT total_access_count
            FROM url_statistics
            WHERE short_code = ?
            "#,
        )
        .bind(code.as_str())
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("total_access_count"))
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(code = %code, total, "Incremented total in MySQL");
        Ok(total)
    }

    async fn update_last_access_time(
        &self,
        code: &ShortCode,
        timestamp_millis: i64,
    ) -> std::result::Result<(), MetricsError> {
        let now = now_unix_millis();

        sqlx::query(
            r#"
            INSERT INTO url_statistics
                (short_code, total_access_count, last_accessed_at, created_at, updated_at)
            VALUES (?, 0, ?, ?, ?) AS incoming
            ON DUPLICATE KEY UPDATE
                last_accessed_at = incoming.last_accessed_at,
                updated_at = incoming.updated_at
            "#,
        )
        .bind(code.as_str())
        .bind(timestamp_millis)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            warn!(code = %code, error = %e, "Failed to update last access time in MySQL");
            map_sqlx_error(e)
        })?;

        trace!(code = %code, timestamp_millis, "Updated last access time in MySQL");
        Ok(())
    }
}
