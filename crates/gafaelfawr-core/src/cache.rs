//! Single-flight memoization for derived (notebook/internal) tokens.
//!
//! Deriving a child token is not free — it goes through the full
//! `TokenService::create` path, including a relational-store write and a
//! history-log append. A notebook that fires off a dozen concurrent requests
//! needing the same internal token for the same downstream service should
//! not mint a dozen children for it. [`TokenCache`] makes concurrent
//! requests for the same `(parent, service, scopes)` triple collapse onto
//! one in-flight derivation.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::TokenError;
use crate::model::Token;

/// Which derivation a [`DerivedKey`] identifies. Part of the cache key
/// because a notebook token and an internal token derived from the same
/// parent with the same scopes are still distinct tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivedKind {
    Notebook,
    Internal,
}

/// Key identifying one derived-token slot: `(parent.key, service?,
/// sortedScopes, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivedKey {
    pub parent_key: String,
    pub service: Option<String>,
    pub scopes: Vec<String>,
    pub kind: DerivedKind,
}

/// A single-flight cache of derived tokens, keyed by [`DerivedKey`].
///
/// Each slot carries its own lock so deriving tokens for different parents
/// (or different services under the same parent) never blocks on each
/// other — only truly identical concurrent requests serialize.
#[derive(Clone, Default)]
pub struct TokenCache {
    locks: Arc<DashMap<DerivedKey, Arc<AsyncMutex<Option<Token>>>>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish_non_exhaustive()
    }
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token for `key` if one was already derived and
    /// `still_valid` confirms it remains usable, otherwise run `derive` to
    /// produce one and cache it. Concurrent callers with the same `key`
    /// share one `derive` call.
    ///
    /// `still_valid` and `derive` are only invoked while holding the
    /// per-key lock. `still_valid` lets the caller revalidate a cached
    /// token against state outside the cache itself (e.g. that the token
    /// still exists in the KV store and has enough remaining lifetime)
    /// instead of serving a cached token unconditionally.
    pub async fn get_or_derive<V, VFut, F, Fut>(&self, key: DerivedKey, still_valid: V, derive: F) -> Result<Token, TokenError>
    where
        V: Fn(&Token) -> VFut,
        VFut: Future<Output = bool>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, TokenError>>,
    {
        let slot = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone();

        let mut guard = slot.lock().await;
        if let Some(token) = guard.as_ref() {
            if still_valid(token).await {
                return Ok(token.clone());
            }
        }
        let token = derive().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Evict a cached derivation, forcing the next `get_or_derive` call for
    /// that key to derive afresh.
    pub fn invalidate(&self, key: &DerivedKey) {
        self.locks.remove(key);
    }

    /// Evict every cached derivation whose `parent_key` matches. Called when
    /// a parent token is modified or revoked, since its children's scopes
    /// and lifetimes are no longer guaranteed to match what was cached.
    pub fn invalidate_parent(&self, parent_key: &str) {
        self.locks.retain(|k, _| k.parent_key != parent_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(parent: &str) -> DerivedKey {
        DerivedKey {
            parent_key: parent.to_owned(),
            service: Some("svc".to_owned()),
            scopes: vec!["read:all".to_owned()],
            kind: DerivedKind::Internal,
        }
    }

    async fn always_valid(_token: &Token) -> bool {
        true
    }

    #[tokio::test]
    async fn second_call_reuses_first_derivation() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_derive(key("p1"), always_valid, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Token::new())
            })
            .await
            .unwrap();
        let second = cache
            .get_or_derive(key("p1"), always_valid, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Token::new())
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_derive_independently() {
        let cache = TokenCache::new();
        let a = cache
            .get_or_derive(key("p1"), always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        let b = cache
            .get_or_derive(key("p2"), always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn invalidate_forces_rederivation() {
        let cache = TokenCache::new();
        let k = key("p1");
        let first = cache
            .get_or_derive(k.clone(), always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        cache.invalidate(&k);
        let second = cache
            .get_or_derive(k, always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn invalidate_parent_clears_all_matching_slots() {
        let cache = TokenCache::new();
        let mut svc_a = key("p1");
        svc_a.service = Some("svc-a".to_owned());
        let mut svc_b = key("p1");
        svc_b.service = Some("svc-b".to_owned());

        let a1 = cache
            .get_or_derive(svc_a.clone(), always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        let b1 = cache
            .get_or_derive(svc_b.clone(), always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();

        cache.invalidate_parent("p1");

        let a2 = cache
            .get_or_derive(svc_a, always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        let b2 = cache
            .get_or_derive(svc_b, always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();

        assert_ne!(a1, a2);
        assert_ne!(b1, b2);
    }

    #[tokio::test]
    async fn still_valid_false_forces_rederivation_without_explicit_invalidate() {
        let cache = TokenCache::new();
        let k = key("p1");

        let first = cache
            .get_or_derive(k.clone(), always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        let second = cache
            .get_or_derive(k, |_token| async { false }, || async { Ok(Token::new()) })
            .await
            .unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn derive_error_propagates_and_leaves_the_slot_empty() {
        let cache = TokenCache::new();
        let k = key("p1");

        let err = cache
            .get_or_derive(k.clone(), always_valid, || async { Err(TokenError::NotFound) })
            .await;
        assert!(err.is_err());

        let token = cache
            .get_or_derive(k, always_valid, || async { Ok(Token::new()) })
            .await
            .unwrap();
        let _ = token;
    }
}
