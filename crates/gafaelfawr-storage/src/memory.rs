//! In-memory storage backend, for local development and tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// An in-memory, TTL-aware key-value store.
///
/// Cloning shares the underlying map (it is an `Arc<RwLock<..>>` internally),
/// so a single [`MemoryBackend`] can be handed out to multiple call sites
/// that all see the same data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<chrono::Duration>,
    ) -> Result<(), StorageError> {
        let expires_at = ttl.map(|d| Utc::now() + d);
        let mut data = self.data.write().await;
        data.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).is_some_and(|e| !e.is_expired()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let backend = MemoryBackend::new();
        backend.put("a", b"hello", None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing_value() {
        let backend = MemoryBackend::new();
        backend.put("a", b"first", None).await.unwrap();
        backend.put("a", b"second", None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let backend = MemoryBackend::new();
        backend.put("a", b"hello", None).await.unwrap();
        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_missing_key_is_not_an_error() {
        let backend = MemoryBackend::new();
        backend.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_only_matching_prefix() {
        let backend = MemoryBackend::new();
        backend.put("tokens/a", b"1", None).await.unwrap();
        backend.put("tokens/b", b"2", None).await.unwrap();
        backend.put("codes/c", b"3", None).await.unwrap();

        let mut keys = backend.list("tokens/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tokens/a".to_owned(), "tokens/b".to_owned()]);
    }

    #[tokio::test]
    async fn exists_reflects_current_state() {
        let backend = MemoryBackend::new();
        assert!(!backend.exists("a").await.unwrap());
        backend.put("a", b"1", None).await.unwrap();
        assert!(backend.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let backend = MemoryBackend::new();
        backend
            .put("a", b"1", Some(chrono::Duration::seconds(-1)))
            .await
            .unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert!(!backend.exists("a").await.unwrap());
        assert!(backend.list("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clone_shares_underlying_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("a", b"1", None).await.unwrap();
        assert_eq!(clone.get("a").await.unwrap(), Some(b"1".to_vec()));
    }
}
