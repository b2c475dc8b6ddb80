//! The KV token store: the authoritative, TTL-backed copy of a token's live
//! payload.
//!
//! Keyed by `tokens/<token_key>`, holding the serialized [`TokenData`] plus a
//! hash of the token's secret so a caller presenting a full bearer token can
//! be authenticated without a second round trip. The relational store
//! (`relational_store.rs`) holds the durable index; this store is what
//! expires on its own once a token's `expires` passes, via the backend's
//! native TTL.

use std::sync::Arc;

use gafaelfawr_storage::StorageBackend;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::model::{Token, TokenData};

const KEY_PREFIX: &str = "tokens/";

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    secret_hash: String,
    data: TokenData,
}

/// The KV-backed store for live token payloads.
#[derive(Clone)]
pub struct KvTokenStore {
    backend: Arc<dyn StorageBackend>,
}

impl KvTokenStore {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn storage_key(token_key: &str) -> String {
        format!("{KEY_PREFIX}{token_key}")
    }

    /// Store the data for a token, computing the secret hash from `token`
    /// and the TTL from `data.expires`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend write fails.
    pub async fn store_data(&self, token: &Token, data: &TokenData) -> Result<(), TokenError> {
        let entry = StoredEntry {
            secret_hash: token.hash_secret(),
            data: data.clone(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| {
            TokenError::Relational(format!("failed to serialize token data: {e}"))
        })?;
        self.backend
            .put(&Self::storage_key(&token.key), &bytes, data.kv_ttl())
            .await?;
        Ok(())
    }

    /// Look up data by key alone, without authenticating a secret. Used for
    /// server-side operations (listing, modification by an admin) where the
    /// caller has already been authorized some other way.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend read fails.
    pub async fn get_data_by_key(&self, token_key: &str) -> Result<Option<TokenData>, TokenError> {
        let raw = self.backend.get(&Self::storage_key(token_key)).await?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let entry: StoredEntry = serde_json::from_slice(&bytes).map_err(|e| {
                    TokenError::Relational(format!("failed to deserialize token data: {e}"))
                })?;
                Ok(Some(entry.data))
            }
        }
    }

    /// Authenticate a full bearer token (key + secret) and return its data.
    ///
    /// Returns `Ok(None)` both when the key is absent and when the secret
    /// does not match — callers must not be able to distinguish the two
    /// from the return value.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend read fails.
    pub async fn get_data(&self, token: &Token) -> Result<Option<TokenData>, TokenError> {
        let raw = self.backend.get(&Self::storage_key(&token.key)).await?;
        let Some(bytes) = raw else {
            return Ok(None);
        };
        let entry: StoredEntry = serde_json::from_slice(&bytes).map_err(|e| {
            TokenError::Relational(format!("failed to deserialize token data: {e}"))
        })?;
        if !token.secret_matches_hash(&entry.secret_hash) {
            return Ok(None);
        }
        Ok(Some(entry.data))
    }

    /// Rewrite the data for an existing entry while preserving its stored
    /// secret hash, recomputing the TTL from `data.expires`. Used by
    /// modification paths that only have the key, not the secret, on hand.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] if no entry exists for `token_key`,
    /// or [`TokenError::Storage`] if the backend read/write fails.
    pub async fn rewrite_data_preserving_secret(
        &self,
        token_key: &str,
        data: &TokenData,
    ) -> Result<(), TokenError> {
        let raw = self
            .backend
            .get(&Self::storage_key(token_key))
            .await?
            .ok_or(TokenError::NotFound)?;
        let existing: StoredEntry = serde_json::from_slice(&raw).map_err(|e| {
            TokenError::Relational(format!("failed to deserialize token data: {e}"))
        })?;
        let entry = StoredEntry {
            secret_hash: existing.secret_hash,
            data: data.clone(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| {
            TokenError::Relational(format!("failed to serialize token data: {e}"))
        })?;
        self.backend
            .put(&Self::storage_key(token_key), &bytes, data.kv_ttl())
            .await?;
        Ok(())
    }

    /// Remove a token's KV entry. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend delete fails.
    pub async fn delete(&self, token_key: &str) -> Result<(), TokenError> {
        self.backend.delete(&Self::storage_key(token_key)).await?;
        Ok(())
    }

    /// List all token keys currently present in the KV store (i.e. not yet
    /// expired from the backend's point of view). Used by the audit pass to
    /// compare against the relational side.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend list fails.
    pub async fn list_keys(&self) -> Result<Vec<String>, TokenError> {
        let keys = self.backend.list(KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_owned))
            .collect())
    }
}
