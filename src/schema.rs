//! Schema Manager.
//!
//! Idempotently creates the backing table, its `expires_at` index, the
//! `upsert`/`delete` stored procedures, the row-level broadcast trigger and
//! a metadata row recording the schema version under a caller-supplied
//! object prefix. Multi-tenant databases hosting independent cache
//! namespaces must not share a trigger or channel, so the prefix is woven
//! into every object name.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;

/// The schema version this crate knows how to create and speak to.
pub const SCHEMA_VERSION: i32 = 1;

/// Ensures the prefixed schema exists, creating it on first use.
pub struct SchemaManager {
    prefix: String,
    channel: String,
}

impl SchemaManager {
    /// Build a schema manager for the given object prefix and channel.
    /// Both have already been validated by [`crate::Config`].
    pub fn new(prefix: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            channel: channel.into(),
        }
    }

    fn table(&self) -> String {
        format!("{}_entries", self.prefix)
    }

    fn meta_table(&self) -> String {
        format!("{}_meta", self.prefix)
    }

    fn upsert_fn(&self) -> String {
        format!("{}_upsert", self.prefix)
    }

    fn delete_fn(&self) -> String {
        format!("{}_delete", self.prefix)
    }

    fn broadcast_fn(&self) -> String {
        format!("{}_broadcast_fn", self.prefix)
    }

    fn trigger(&self) -> String {
        format!("{}_broadcast", self.prefix)
    }

    /// Idempotently ensure every database object exists. If the metadata
    /// row already reports a compatible schema version, nothing changes;
    /// an incompatible version is a [`crate::CacheError::ConfigError`]
    /// requiring an out-of-band migration.
    pub async fn ensure(&self, pool: &PgPool) -> Result<()> {
        self.ensure_meta_table(pool).await?;

        if let Some(existing) = self.read_schema_version(pool).await? {
            if existing != SCHEMA_VERSION {
                return Err(crate::error::CacheError::ConfigError(format!(
                    "{} reports schema version {existing}, this client speaks {SCHEMA_VERSION}; \
                     an out-of-band migration is required",
                    self.meta_table()
                )));
            }
            debug!(prefix = %self.prefix, "schema already present and compatible");
            return Ok(());
        }

        self.create_table(pool).await?;
        self.create_index(pool).await?;
        self.create_upsert_fn(pool).await?;
        self.create_delete_fn(pool).await?;
        self.create_trigger(pool).await?;
        self.record_meta(pool).await?;

        info!(prefix = %self.prefix, version = SCHEMA_VERSION, "schema created");
        Ok(())
    }

    async fn ensure_meta_table(&self, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {meta} (
                schema_version INT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            meta = self.meta_table()
        );
        sqlx::query(&sql).execute(pool).await?;
        Ok(())
    }

    async fn read_schema_version(&self, pool: &PgPool) -> Result<Option<i32>> {
        let sql = format!(
            "SELECT schema_version FROM {meta} ORDER BY created_at DESC LIMIT 1",
            meta = self.meta_table()
        );
        let row: Option<(i32,)> = sqlx::query_as(&sql).fetch_optional(pool).await?;
        Ok(row.map(|(v,)| v))
    }

    async fn record_meta(&self, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "INSERT INTO {meta} (schema_version) VALUES ($1)",
            meta = self.meta_table()
        );
        sqlx::query(&sql).bind(SCHEMA_VERSION).execute(pool).await?;
        Ok(())
    }

    async fn create_table(&self, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key BYTEA PRIMARY KEY,
                value BYTEA NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                expires_at TIMESTAMPTZ NULL
            )",
            table = self.table()
        );
        sqlx::query(&sql).execute(pool).await?;

        let seq_sql = format!("CREATE SEQUENCE IF NOT EXISTS {}_version_seq", self.prefix);
        sqlx::query(&seq_sql).execute(pool).await?;
        Ok(())
    }

    async fn create_index(&self, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {prefix}_expires_at_idx ON {table} (expires_at)",
            prefix = self.prefix,
            table = self.table()
        );
        sqlx::query(&sql).execute(pool).await?;
        Ok(())
    }

    async fn create_upsert_fn(&self, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "CREATE OR REPLACE FUNCTION {func}(p_key BYTEA, p_value BYTEA, p_ttl INTERVAL)
             RETURNS BIGINT AS $$
             DECLARE
                 new_version BIGINT;
                 new_expires TIMESTAMPTZ;
             BEGIN
                 new_version := nextval('{seq}');
                 IF p_ttl IS NULL THEN
                     new_expires := NULL;
                 ELSE
                     new_expires := now() + p_ttl;
                 END IF;

                 INSERT INTO {table} (key, value, version, created_at, expires_at)
                 VALUES (p_key, p_value, new_version, now(), new_expires)
                 ON CONFLICT (key) DO UPDATE
                     SET value = EXCLUDED.value,
                         version = EXCLUDED.version,
                         created_at = EXCLUDED.created_at,
                         expires_at = EXCLUDED.expires_at;

                 RETURN new_version;
             END;
             $$ LANGUAGE plpgsql;",
            func = self.upsert_fn(),
            seq = format!("{}_version_seq", self.prefix),
            table = self.table()
        );
        sqlx::query(&sql).execute(pool).await?;
        Ok(())
    }

    async fn create_delete_fn(&self, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "CREATE OR REPLACE FUNCTION {func}(p_key BYTEA)
             RETURNS BIGINT AS $$
             DECLARE
                 deleted_version BIGINT;
             BEGIN
                 DELETE FROM {table} WHERE key = p_key RETURNING version INTO deleted_version;
                 RETURN deleted_version;
             END;
             $$ LANGUAGE plpgsql;",
            func = self.delete_fn(),
            table = self.table()
        );
        sqlx::query(&sql).execute(pool).await?;
        Ok(())
    }

    async fn create_trigger(&self, pool: &PgPool) -> Result<()> {
        let fn_sql = format!(
            "CREATE OR REPLACE FUNCTION {func}() RETURNS TRIGGER AS $$
             DECLARE
                 payload JSON;
             BEGIN
                 IF TG_OP = 'DELETE' THEN
                     payload := json_build_object(
                         'op', 'delete',
                         'key', encode(OLD.key, 'base64'),
                         'version', OLD.version,
                         'expires_at', NULL
                     );
                 ELSE
                     payload := json_build_object(
                         'op', 'upsert',
                         'key', encode(NEW.key, 'base64'),
                         'version', NEW.version,
                         'expires_at', NEW.expires_at
                     );
                 END IF;
                 PERFORM pg_notify('{channel}', payload::text);
                 RETURN NULL;
             END;
             $$ LANGUAGE plpgsql;",
            func = self.broadcast_fn(),
            channel = self.channel
        );
        sqlx::query(&fn_sql).execute(pool).await?;

        let drop_sql = format!(
            "DROP TRIGGER IF EXISTS {trigger} ON {table}",
            trigger = self.trigger(),
            table = self.table()
        );
        sqlx::query(&drop_sql).execute(pool).await?;

        let trigger_sql = format!(
            "CREATE TRIGGER {trigger}
             AFTER INSERT OR UPDATE OR DELETE ON {table}
             FOR EACH ROW EXECUTE FUNCTION {func}()",
            trigger = self.trigger(),
            table = self.table(),
            func = self.broadcast_fn()
        );
        sqlx::query(&trigger_sql).execute(pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_prefixed() {
        let manager = SchemaManager::new("tenant_a", "tenant_a_events");
        assert_eq!(manager.table(), "tenant_a_entries");
        assert_eq!(manager.meta_table(), "tenant_a_meta");
        assert_eq!(manager.upsert_fn(), "tenant_a_upsert");
        assert_eq!(manager.delete_fn(), "tenant_a_delete");
        assert_eq!(manager.trigger(), "tenant_a_broadcast");
    }
}
