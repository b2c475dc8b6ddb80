//! The relational token store: the durable index over tokens.
//!
//! Unlike the KV store, this store never expires rows on its own —
//! expiration is enforced by the periodic sweep (`TokenService::expire_tokens`)
//! rather than a backend TTL, because listing and history need to see a
//! token's row right up until it is explicitly reaped. It is also the only
//! place the parent→child graph and the `token_name`/`service` fields live.
//!
//! Two implementations are provided: an in-memory one for local development
//! and tests, and a PostgreSQL-backed one for production, mirroring the split
//! in `gafaelfawr_storage`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TokenError;
use crate::model::{TokenInfo, TokenType};

/// Filter parameters for listing tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenFilter {
    pub username: Option<String>,
    pub token_type: Option<TokenType>,
}

/// The durable token index.
#[async_trait]
pub trait RelationalTokenStore: Send + Sync + 'static {
    /// Insert a new row. Fails with [`TokenError::DuplicateTokenName`] if a
    /// `user` token with the same `token_name` already exists for this
    /// username.
    async fn add(&self, info: &TokenInfo) -> Result<(), TokenError>;

    /// Apply a partial update. `None` fields are left unchanged; to clear a
    /// nullable field callers pass `Some(None)` via the dedicated
    /// `clear_expires` flag (scopes/token_name cannot be cleared, only
    /// replaced, matching the upstream model).
    async fn modify(&self, update: &TokenInfoUpdate) -> Result<(), TokenError>;

    /// Fetch one row by key.
    async fn get_info(&self, token_key: &str) -> Result<Option<TokenInfo>, TokenError>;

    /// Delete one row. Returns `true` if a row was actually removed.
    async fn delete(&self, token_key: &str) -> Result<bool, TokenError>;

    /// All descendants of `token_key`, breadth-first (direct children first,
    /// then their children, and so on).
    async fn get_children(&self, token_key: &str) -> Result<Vec<String>, TokenError>;

    /// List tokens matching `filter`, most recently created first.
    async fn list(&self, filter: &TokenFilter) -> Result<Vec<TokenInfo>, TokenError>;

    /// All rows whose `expires` is in the past as of `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<TokenInfo>, TokenError>;
}

/// A partial update to apply to a [`TokenInfo`] row.
#[derive(Debug, Clone, Default)]
pub struct TokenInfoUpdate {
    pub token_key: String,
    pub token_name: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub expires: Option<DateTime<Utc>>,
    pub clear_expires: bool,
}

/// In-memory implementation, for local development and tests.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::{RelationalTokenStore, TokenFilter, TokenInfoUpdate};
    use crate::error::TokenError;
    use crate::model::TokenInfo;
    use chrono::{DateTime, Utc};

    /// An in-process, lock-guarded implementation of [`RelationalTokenStore`].
    #[derive(Clone, Default)]
    pub struct MemoryRelationalStore {
        rows: Arc<RwLock<HashMap<String, TokenInfo>>>,
    }

    impl std::fmt::Debug for MemoryRelationalStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MemoryRelationalStore").finish_non_exhaustive()
        }
    }

    impl MemoryRelationalStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl RelationalTokenStore for MemoryRelationalStore {
        async fn add(&self, info: &TokenInfo) -> Result<(), TokenError> {
            let mut rows = self.rows.write().await;
            if info.token_type == crate::model::TokenType::User {
                let duplicate = rows.values().any(|existing| {
                    existing.username == info.username
                        && existing.token_name.is_some()
                        && existing.token_name == info.token_name
                });
                if duplicate {
                    let name = info.token_name.clone().unwrap_or_default();
                    return Err(TokenError::DuplicateTokenName(name));
                }
            }
            rows.insert(info.token_key.clone(), info.clone());
            Ok(())
        }

        async fn modify(&self, update: &TokenInfoUpdate) -> Result<(), TokenError> {
            let mut rows = self.rows.write().await;
            let row = rows.get_mut(&update.token_key).ok_or(TokenError::NotFound)?;
            if let Some(name) = &update.token_name {
                row.token_name = Some(name.clone());
            }
            if let Some(scopes) = &update.scopes {
                row.scopes = scopes.clone();
            }
            if update.clear_expires {
                row.expires = None;
            } else if let Some(expires) = update.expires {
                row.expires = Some(expires);
            }
            Ok(())
        }

        async fn get_info(&self, token_key: &str) -> Result<Option<TokenInfo>, TokenError> {
            Ok(self.rows.read().await.get(token_key).cloned())
        }

        async fn delete(&self, token_key: &str) -> Result<bool, TokenError> {
            Ok(self.rows.write().await.remove(token_key).is_some())
        }

        async fn get_children(&self, token_key: &str) -> Result<Vec<String>, TokenError> {
            let rows = self.rows.read().await;
            let mut descendants = Vec::new();
            let mut frontier = vec![token_key.to_owned()];
            while !frontier.is_empty() {
                let mut next_frontier = Vec::new();
                for parent in &frontier {
                    let mut level: Vec<_> = rows
                        .values()
                        .filter(|r| r.parent.as_deref() == Some(parent.as_str()))
                        .collect();
                    level.sort_by_key(|r| r.created);
                    next_frontier.extend(level.iter().map(|r| r.token_key.clone()));
                }
                descendants.extend(next_frontier.iter().cloned());
                frontier = next_frontier;
            }
            Ok(descendants)
        }

        async fn list(&self, filter: &TokenFilter) -> Result<Vec<TokenInfo>, TokenError> {
            let rows = self.rows.read().await;
            let mut matched: Vec<_> = rows
                .values()
                .filter(|r| {
                    filter.username.as_deref().is_none_or(|u| u == r.username)
                        && filter.token_type.is_none_or(|t| t == r.token_type)
                })
                .cloned()
                .collect();
            matched.sort_by_key(|r| std::cmp::Reverse(r.created));
            Ok(matched)
        }

        async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<TokenInfo>, TokenError> {
            let rows = self.rows.read().await;
            Ok(rows
                .values()
                .filter(|r| r.expires.is_some_and(|e| e <= now))
                .cloned()
                .collect())
        }
    }
}

/// PostgreSQL-backed implementation.
pub mod postgres {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, Row};

    use super::{RelationalTokenStore, TokenFilter, TokenInfoUpdate};
    use crate::error::TokenError;
    use crate::model::{TokenInfo, TokenType};

    /// A [`RelationalTokenStore`] backed by a `token` table in PostgreSQL.
    #[derive(Clone)]
    pub struct PostgresRelationalStore {
        pool: PgPool,
    }

    impl std::fmt::Debug for PostgresRelationalStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PostgresRelationalStore").finish_non_exhaustive()
        }
    }

    impl PostgresRelationalStore {
        /// Connect and run the initial migration.
        ///
        /// # Errors
        ///
        /// Returns [`TokenError::Relational`] if connecting or migrating fails.
        pub async fn connect(database_url: &str) -> Result<Self, TokenError> {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .map_err(|e| TokenError::Relational(format!("connect failed: {e}")))?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS token (\
                    token_key   TEXT PRIMARY KEY, \
                    username    TEXT NOT NULL, \
                    token_type  TEXT NOT NULL, \
                    scopes      TEXT NOT NULL, \
                    created     TIMESTAMPTZ NOT NULL, \
                    expires     TIMESTAMPTZ, \
                    token_name  TEXT, \
                    parent      TEXT REFERENCES token(token_key), \
                    service     TEXT\
                )",
            )
            .execute(&pool)
            .await
            .map_err(|e| TokenError::Relational(format!("migration failed: {e}")))?;

            sqlx::query(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_token_username_name \
                 ON token (username, token_name) WHERE token_type = 'user'",
            )
            .execute(&pool)
            .await
            .map_err(|e| TokenError::Relational(format!("index creation failed: {e}")))?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_token_parent ON token (parent)")
                .execute(&pool)
                .await
                .map_err(|e| TokenError::Relational(format!("index creation failed: {e}")))?;

            Ok(Self { pool })
        }

        fn row_to_info(row: &sqlx::postgres::PgRow) -> Result<TokenInfo, TokenError> {
            let token_type_str: String = row.try_get("token_type").map_err(err)?;
            let scopes_str: String = row.try_get("scopes").map_err(err)?;
            Ok(TokenInfo {
                token_key: row.try_get("token_key").map_err(err)?,
                username: row.try_get("username").map_err(err)?,
                token_type: parse_token_type(&token_type_str)?,
                scopes: split_scopes(&scopes_str),
                created: row.try_get("created").map_err(err)?,
                expires: row.try_get("expires").map_err(err)?,
                token_name: row.try_get("token_name").map_err(err)?,
                parent: row.try_get("parent").map_err(err)?,
                service: row.try_get("service").map_err(err)?,
            })
        }
    }

    fn err(e: sqlx::Error) -> TokenError {
        TokenError::Relational(e.to_string())
    }

    fn token_type_str(t: TokenType) -> &'static str {
        match t {
            TokenType::Session => "session",
            TokenType::User => "user",
            TokenType::Notebook => "notebook",
            TokenType::Internal => "internal",
            TokenType::Service => "service",
        }
    }

    fn parse_token_type(s: &str) -> Result<TokenType, TokenError> {
        match s {
            "session" => Ok(TokenType::Session),
            "user" => Ok(TokenType::User),
            "notebook" => Ok(TokenType::Notebook),
            "internal" => Ok(TokenType::Internal),
            "service" => Ok(TokenType::Service),
            other => Err(TokenError::Relational(format!("unknown token_type '{other}'"))),
        }
    }

    fn join_scopes(scopes: &[String]) -> String {
        scopes.join(",")
    }

    fn split_scopes(s: &str) -> Vec<String> {
        if s.is_empty() {
            Vec::new()
        } else {
            s.split(',').map(str::to_owned).collect()
        }
    }

    #[async_trait]
    impl RelationalTokenStore for PostgresRelationalStore {
        async fn add(&self, info: &TokenInfo) -> Result<(), TokenError> {
            let result = sqlx::query(
                "INSERT INTO token \
                 (token_key, username, token_type, scopes, created, expires, token_name, parent, service) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&info.token_key)
            .bind(&info.username)
            .bind(token_type_str(info.token_type))
            .bind(join_scopes(&info.scopes))
            .bind(info.created)
            .bind(info.expires)
            .bind(&info.token_name)
            .bind(&info.parent)
            .bind(&info.service)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    Err(TokenError::DuplicateTokenName(
                        info.token_name.clone().unwrap_or_default(),
                    ))
                }
                Err(e) => Err(err(e)),
            }
        }

        async fn modify(&self, update: &TokenInfoUpdate) -> Result<(), TokenError> {
            if let Some(name) = &update.token_name {
                sqlx::query("UPDATE token SET token_name = $1 WHERE token_key = $2")
                    .bind(name)
                    .bind(&update.token_key)
                    .execute(&self.pool)
                    .await
                    .map_err(err)?;
            }
            if let Some(scopes) = &update.scopes {
                sqlx::query("UPDATE token SET scopes = $1 WHERE token_key = $2")
                    .bind(join_scopes(scopes))
                    .bind(&update.token_key)
                    .execute(&self.pool)
                    .await
                    .map_err(err)?;
            }
            if update.clear_expires {
                sqlx::query("UPDATE token SET expires = NULL WHERE token_key = $1")
                    .bind(&update.token_key)
                    .execute(&self.pool)
                    .await
                    .map_err(err)?;
            } else if let Some(expires) = update.expires {
                sqlx::query("UPDATE token SET expires = $1 WHERE token_key = $2")
                    .bind(expires)
                    .bind(&update.token_key)
                    .execute(&self.pool)
                    .await
                    .map_err(err)?;
            }
            Ok(())
        }

        async fn get_info(&self, token_key: &str) -> Result<Option<TokenInfo>, TokenError> {
            let row = sqlx::query("SELECT * FROM token WHERE token_key = $1")
                .bind(token_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(err)?;
            row.as_ref().map(Self::row_to_info).transpose()
        }

        async fn delete(&self, token_key: &str) -> Result<bool, TokenError> {
            let result = sqlx::query("DELETE FROM token WHERE token_key = $1")
                .bind(token_key)
                .execute(&self.pool)
                .await
                .map_err(err)?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_children(&self, token_key: &str) -> Result<Vec<String>, TokenError> {
            let rows = sqlx::query(
                "WITH RECURSIVE descendants(token_key, parent, created, depth) AS (\
                    SELECT token_key, parent, created, 0 \
                    FROM token WHERE parent = $1 \
                    UNION ALL \
                    SELECT t.token_key, t.parent, t.created, d.depth + 1 \
                    FROM token t JOIN descendants d ON t.parent = d.token_key \
                 ) \
                 SELECT token_key FROM descendants ORDER BY depth, created",
            )
            .bind(token_key)
            .fetch_all(&self.pool)
            .await
            .map_err(err)?;
            rows.iter()
                .map(|r| r.try_get::<String, _>("token_key").map_err(err))
                .collect()
        }

        async fn list(&self, filter: &TokenFilter) -> Result<Vec<TokenInfo>, TokenError> {
            let rows = sqlx::query(
                "SELECT * FROM token \
                 WHERE ($1::TEXT IS NULL OR username = $1) \
                   AND ($2::TEXT IS NULL OR token_type = $2) \
                 ORDER BY created DESC",
            )
            .bind(&filter.username)
            .bind(filter.token_type.map(token_type_str))
            .fetch_all(&self.pool)
            .await
            .map_err(err)?;
            rows.iter().map(Self::row_to_info).collect()
        }

        async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<TokenInfo>, TokenError> {
            let rows = sqlx::query("SELECT * FROM token WHERE expires IS NOT NULL AND expires <= $1")
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .map_err(err)?;
            rows.iter().map(Self::row_to_info).collect()
        }
    }
}

pub use memory::MemoryRelationalStore;
pub use postgres::PostgresRelationalStore;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relational_store::memory::MemoryRelationalStore;

    fn sample(key: &str, username: &str) -> TokenInfo {
        TokenInfo {
            token_key: key.to_owned(),
            username: username.to_owned(),
            token_type: TokenType::User,
            scopes: vec!["read:all".to_owned()],
            created: Utc::now(),
            expires: None,
            token_name: Some("laptop".to_owned()),
            parent: None,
            service: None,
        }
    }

    #[tokio::test]
    async fn add_then_get_info_round_trips() {
        let store = MemoryRelationalStore::new();
        let info = sample("k1", "alice");
        store.add(&info).await.unwrap();
        assert_eq!(store.get_info("k1").await.unwrap(), Some(info));
    }

    #[tokio::test]
    async fn add_rejects_duplicate_token_name_for_same_user() {
        let store = MemoryRelationalStore::new();
        store.add(&sample("k1", "alice")).await.unwrap();
        let dup = store.add(&sample("k2", "alice")).await;
        assert!(matches!(dup, Err(TokenError::DuplicateTokenName(_))));
    }

    #[tokio::test]
    async fn add_allows_same_name_for_different_users() {
        let store = MemoryRelationalStore::new();
        store.add(&sample("k1", "alice")).await.unwrap();
        store.add(&sample("k2", "bob")).await.unwrap();
    }

    #[tokio::test]
    async fn get_children_returns_direct_children() {
        let store = MemoryRelationalStore::new();
        let mut parent = sample("parent", "alice");
        parent.token_type = TokenType::User;
        store.add(&parent).await.unwrap();

        let mut child1 = sample("child1", "alice");
        child1.token_type = TokenType::Notebook;
        child1.token_name = None;
        child1.parent = Some("parent".to_owned());
        store.add(&child1).await.unwrap();

        let mut child2 = sample("child2", "alice");
        child2.token_type = TokenType::Internal;
        child2.token_name = None;
        child2.parent = Some("parent".to_owned());
        store.add(&child2).await.unwrap();

        let children = store.get_children("parent").await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&"child1".to_owned()));
        assert!(children.contains(&"child2".to_owned()));
    }

    #[tokio::test]
    async fn get_children_returns_transitive_descendants_breadth_first() {
        let store = MemoryRelationalStore::new();
        let mut session = sample("session", "alice");
        session.token_type = TokenType::Session;
        session.token_name = None;
        store.add(&session).await.unwrap();

        let mut notebook = sample("notebook", "alice");
        notebook.token_type = TokenType::Notebook;
        notebook.token_name = None;
        notebook.parent = Some("session".to_owned());
        store.add(&notebook).await.unwrap();

        let mut internal = sample("internal", "alice");
        internal.token_type = TokenType::Internal;
        internal.token_name = None;
        internal.parent = Some("notebook".to_owned());
        store.add(&internal).await.unwrap();

        let descendants = store.get_children("session").await.unwrap();
        assert_eq!(descendants, vec!["notebook".to_owned(), "internal".to_owned()]);
    }

    #[tokio::test]
    async fn modify_updates_only_given_fields() {
        let store = MemoryRelationalStore::new();
        store.add(&sample("k1", "alice")).await.unwrap();

        store
            .modify(&TokenInfoUpdate {
                token_key: "k1".to_owned(),
                scopes: Some(vec!["admin:token".to_owned()]),
                ..Default::default()
            })
            .await
            .unwrap();

        let info = store.get_info("k1").await.unwrap().unwrap();
        assert_eq!(info.scopes, vec!["admin:token".to_owned()]);
        assert_eq!(info.token_name, Some("laptop".to_owned()));
    }

    #[tokio::test]
    async fn list_filters_by_username_and_type() {
        let store = MemoryRelationalStore::new();
        store.add(&sample("k1", "alice")).await.unwrap();
        store.add(&sample("k2", "bob")).await.unwrap();

        let results = store
            .list(&TokenFilter {
                username: Some("alice".to_owned()),
                token_type: None,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].token_key, "k1");
    }

    #[tokio::test]
    async fn list_expired_returns_only_past_expiry() {
        let store = MemoryRelationalStore::new();
        let mut expired = sample("k1", "alice");
        expired.expires = Some(Utc::now() - chrono::Duration::hours(1));
        store.add(&expired).await.unwrap();

        let mut live = sample("k2", "bob");
        live.expires = Some(Utc::now() + chrono::Duration::hours(1));
        store.add(&live).await.unwrap();

        let result = store.list_expired(Utc::now()).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].token_key, "k1");
    }

    #[tokio::test]
    async fn delete_returns_false_for_missing_row() {
        let store = MemoryRelationalStore::new();
        assert!(!store.delete("missing").await.unwrap());
    }
}
