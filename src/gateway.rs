//! Database Gateway.
//!
//! A thin, statistics-gathering wrapper over a pooled PostgreSQL connection,
//! exposing exactly the operations the facade needs: single-key read,
//! upsert, delete, bulk read and an optional expired-row sweep. Failures are
//! always surfaced as [`CacheError`]; transient connection errors on the
//! idempotent read path are retried with bounded exponential back-off,
//! writes are never blindly retried since the gateway cannot prove an
//! upsert whose connection dropped before acknowledging `COMMIT` did not
//! already take effect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::error::{CacheError, Result};
use crate::model::Entry;
use crate::schema::SchemaManager;

/// Snapshot of gateway-level counters, matching the observable counters
/// named in the external interface (`db_reads`, `db_writes`).
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    /// Total number of `read`/`bulk_read` calls that reached the database.
    pub db_reads: u64,
    /// Total number of `upsert`/`delete` calls that reached the database.
    pub db_writes: u64,
    /// Total number of retried operations.
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    db_reads: AtomicU64,
    db_writes: AtomicU64,
    retries: AtomicU64,
}

/// Thin wrapper over a pooled PostgreSQL connection.
#[derive(Clone)]
pub struct Gateway {
    pool: PgPool,
    table: String,
    upsert_fn: String,
    delete_fn: String,
    timeout: Duration,
    counters: Arc<Counters>,
}

const MAX_READ_RETRIES: u32 = 3;

impl Gateway {
    /// Connect a pool and ensure the prefixed schema exists.
    pub async fn connect(
        dsn: &str,
        pool_size: u32,
        object_prefix: &str,
        channel: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(dsn)
            .await?;

        SchemaManager::new(object_prefix, channel)
            .ensure(&pool)
            .await?;

        Ok(Self {
            pool,
            table: format!("{object_prefix}_entries"),
            upsert_fn: format!("{object_prefix}_upsert"),
            delete_fn: format!("{object_prefix}_delete"),
            timeout,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Read a single row. Rows past TTL are treated as absent, matching the
    /// semantics of every other observer of the table.
    pub async fn read(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.counters.db_reads.fetch_add(1, Ordering::Relaxed);
        let sql = format!(
            "SELECT key, value, version, created_at, expires_at FROM {} \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
            self.table
        );
        self.with_read_retry(|| {
            let sql = sql.clone();
            let key = key.to_vec();
            let pool = self.pool.clone();
            let timeout = self.timeout;
            async move {
                let row = tokio::time::timeout(
                    timeout,
                    sqlx::query(&sql).bind(&key).fetch_optional(&pool),
                )
                .await
                .map_err(|_| CacheError::BackendUnavailable("read timed out".into()))??;
                Ok(row.map(row_to_entry))
            }
        })
        .await
    }

    /// Read every row for a batch of keys in one query.
    pub async fn bulk_read(&self, keys: &[Vec<u8>]) -> Result<Vec<Entry>> {
        self.counters.db_reads.fetch_add(1, Ordering::Relaxed);
        let sql = format!(
            "SELECT key, value, version, created_at, expires_at FROM {} \
             WHERE key = ANY($1) AND (expires_at IS NULL OR expires_at > now())",
            self.table
        );
        let keys = keys.to_vec();
        self.with_read_retry(|| {
            let sql = sql.clone();
            let keys = keys.clone();
            let pool = self.pool.clone();
            let timeout = self.timeout;
            async move {
                let rows = tokio::time::timeout(
                    timeout,
                    sqlx::query(&sql).bind(&keys).fetch_all(&pool),
                )
                .await
                .map_err(|_| CacheError::BackendUnavailable("bulk_read timed out".into()))??;
                Ok(rows.into_iter().map(row_to_entry).collect())
            }
        })
        .await
    }

    /// Insert or update a key, returning the freshly assigned version.
    /// A single round trip through the stored procedure, never retried:
    /// the caller cannot distinguish "failed before commit" from "failed
    /// after commit" without examining the assigned version, which this
    /// call doesn't yet have.
    pub async fn upsert(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> Result<i64> {
        self.counters.db_writes.fetch_add(1, Ordering::Relaxed);
        let sql = format!("SELECT {}($1, $2, $3)", self.upsert_fn);
        let interval = ttl.map(pg_interval);
        let row = tokio::time::timeout(
            self.timeout,
            sqlx::query(&sql)
                .bind(key)
                .bind(value)
                .bind(interval)
                .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| CacheError::BackendUnavailable("upsert timed out".into()))??;
        Ok(row.try_get(0)?)
    }

    /// Delete a key, returning the version it was deleted at, or `None` if
    /// it was already absent. Safe on absent keys.
    pub async fn delete(&self, key: &[u8]) -> Result<Option<i64>> {
        self.counters.db_writes.fetch_add(1, Ordering::Relaxed);
        let sql = format!("SELECT {}($1)", self.delete_fn);
        let row = tokio::time::timeout(
            self.timeout,
            sqlx::query(&sql).bind(key).fetch_one(&self.pool),
        )
        .await
        .map_err(|_| CacheError::BackendUnavailable("delete timed out".into()))??;
        Ok(row.try_get::<Option<i64>, _>(0)?)
    }

    /// Delete up to `batch` expired rows. An optional background task; the
    /// trigger still fires for each row so peers are invalidated normally.
    pub async fn sweep_expired(&self, batch: i64) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE key IN (
                SELECT key FROM {} WHERE expires_at IS NOT NULL AND expires_at <= now() LIMIT $1
             )",
            self.table, self.table
        );
        let result = tokio::time::timeout(
            self.timeout,
            sqlx::query(&sql).bind(batch).execute(&self.pool),
        )
        .await
        .map_err(|_| CacheError::BackendUnavailable("sweep_expired timed out".into()))??;
        Ok(result.rows_affected())
    }

    /// Snapshot the gateway's counters.
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            db_reads: self.counters.db_reads.load(Ordering::Relaxed),
            db_writes: self.counters.db_writes.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// Access the underlying pool, used by the listener to open its
    /// dedicated connection from the same DSN.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn with_read_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(20);
        for attempt in 0..=MAX_READ_RETRIES {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < MAX_READ_RETRIES && is_transient(&err) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(attempt, %err, "retrying transient gateway read");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop always returns on the final attempt")
    }
}

fn is_transient(err: &CacheError) -> bool {
    matches!(err, CacheError::BackendUnavailable(_))
}

fn pg_interval(d: Duration) -> sqlx::postgres::types::PgInterval {
    sqlx::postgres::types::PgInterval {
        months: 0,
        days: 0,
        microseconds: d.as_micros() as i64,
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Entry {
    Entry {
        key: row.get::<Vec<u8>, _>("key"),
        value: row.get::<Option<Vec<u8>>, _>("value"),
        version: row.get::<i64, _>("version"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        expires_at: row.get::<Option<DateTime<Utc>>, _>("expires_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_backend_unavailable_only() {
        assert!(is_transient(&CacheError::BackendUnavailable("x".into())));
        assert!(!is_transient(&CacheError::EncodingError("x".into())));
        assert!(!is_transient(&CacheError::Closed));
    }

    #[test]
    fn pg_interval_converts_whole_seconds() {
        let interval = pg_interval(Duration::from_secs(5));
        assert_eq!(interval.microseconds, 5_000_000);
        assert_eq!(interval.months, 0);
        assert_eq!(interval.days, 0);
    }
}
