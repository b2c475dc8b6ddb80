//! PostgreSQL-backed key-value storage.
//!
//! Stores all key-value data in a single `kv_store` table with an optional
//! expiration column. Useful when a deployment has no dedicated KV service
//! (e.g. Redis) available; expired rows are filtered out on read and swept
//! lazily rather than through a native TTL.
//!
//! Feature-gated behind `postgres-backend`. Uses `sqlx` with the Tokio
//! runtime for fully async operations.

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{StorageBackend, StorageError};

/// A storage backend backed by PostgreSQL.
///
/// Thread-safe via `PgPool` (connection pool). All operations are fully
/// async.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Connect to PostgreSQL and run the initial migration.
    ///
    /// Creates the `kv_store` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                path: "[redacted]".to_owned(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (\
                key        TEXT        PRIMARY KEY, \
                value      BYTEA       NOT NULL, \
                expires_at TIMESTAMPTZ\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: "[redacted]".to_owned(),
            reason: format!("migration failed: {e}"),
        })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kv_store_key_prefix \
             ON kv_store (key text_pattern_ops)",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: "[redacted]".to_owned(),
            reason: format!("index creation failed: {e}"),
        })?;

        Ok(Self { pool })
    }

    /// Return a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM kv_store \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<chrono::Duration>,
    ) -> Result<(), StorageError> {
        let expires_at = ttl.map(|d| Utc::now() + d);
        sqlx::query(
            "INSERT INTO kv_store (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM kv_store \
             WHERE key LIKE $1 AND (expires_at IS NULL OR expires_at > now()) \
             ORDER BY key",
        )
        .bind(format!("{prefix}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::List {
            prefix: prefix.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT EXISTS(\
                SELECT 1 FROM kv_store \
                WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())\
            )",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(row.map(|(e,)| e).unwrap_or(false))
    }
}
