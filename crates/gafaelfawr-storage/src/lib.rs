//! Storage backend abstraction for Gafaelfawr.
//!
//! This crate defines the [`StorageBackend`] trait — a pure key-value
//! storage interface used by the KV token store and the OIDC authorization
//! code store. It knows nothing about tokens, scopes, or authentication;
//! that is layered on top in `gafaelfawr-core`.
//!
//! Two implementations are provided:
//!
//! - [`MemoryBackend`] — in-process, for local development and tests.
//! - [`PostgresBackend`] — production default (feature `postgres-backend`),
//!   approximating a KV store with TTL semantics on top of PostgreSQL when a
//!   dedicated KV service such as Redis is not available.

mod error;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresBackend;

/// A pluggable key-value storage backend with per-key TTL support.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `tokens/<key>`,
/// `oidc-codes/<key>`). Values are opaque byte arrays; callers are
/// responsible for serialization.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// `ttl` is the time the entry should remain retrievable; `None` means
    /// no expiration.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<chrono::Duration>,
    ) -> Result<(), StorageError>;

    /// Delete a key. This is idempotent — deleting a non-existent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, skipping expired
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists (and has not expired).
    ///
    /// The default implementation calls [`get`](StorageBackend::get).
    /// Backends may override this with a more efficient check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
