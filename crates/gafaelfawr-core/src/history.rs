//! The change-history store: an append-only log of every create, edit,
//! revoke, and expire event.
//!
//! Pagination uses an opaque cursor of the form `"<unix-seconds>_<id>"`
//! rather than offsets, so a page boundary survives concurrent inserts.

use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;

use crate::error::HistoryError;
use crate::model::{TokenChangeHistoryEntry, TokenType};

/// A page of change-history results plus the cursor to fetch the next one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<TokenChangeHistoryEntry>,
    pub next_cursor: Option<String>,
    pub total_count: i64,
}

/// Filter parameters for a change-history query.
///
/// `key`, when set, matches rows for that token itself *or* rows whose
/// `parent` equals it — one level of descendants, not the full transitive
/// set, matching the narrower scope a per-token history view is meant to
/// show.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub username: Option<String>,
    pub key: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub token_type: Option<TokenType>,
    pub ip_or_cidr: Option<String>,
    pub cursor: Option<String>,
    pub limit: i64,
}

/// Whether `ip_address` falls within `filter` — a plain IP address or a
/// CIDR block. `filter` is assumed already validated by
/// [`crate::service::validate_ip_or_cidr`].
#[must_use]
pub fn ip_matches(filter: &str, ip_address: &str) -> bool {
    let Ok(candidate) = IpAddr::from_str(ip_address) else {
        return false;
    };
    if let Ok(net) = IpNet::from_str(filter) {
        return net.contains(&candidate);
    }
    IpAddr::from_str(filter).is_ok_and(|exact| exact == candidate)
}

/// An opaque, strictly-increasing pagination cursor: unix seconds and a
/// tie-breaking row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub unix_seconds: i64,
    pub id: i64,
}

impl Cursor {
    #[must_use]
    pub fn encode(self) -> String {
        format!("{}_{}", self.unix_seconds, self.id)
    }

    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidCursor`] if `s` is not of the form
    /// `"<seconds>_<id>"`.
    pub fn decode(s: &str) -> Result<Self, HistoryError> {
        let (secs, id) = s
            .split_once('_')
            .ok_or_else(|| HistoryError::InvalidCursor(s.to_owned()))?;
        let unix_seconds = secs
            .parse()
            .map_err(|_| HistoryError::InvalidCursor(s.to_owned()))?;
        let id = id
            .parse()
            .map_err(|_| HistoryError::InvalidCursor(s.to_owned()))?;
        Ok(Self { unix_seconds, id })
    }
}

/// The change-history log.
#[async_trait]
pub trait ChangeHistoryStore: Send + Sync + 'static {
    /// Append one entry. The store assigns the entry its own ordering id.
    async fn add(&self, entry: &TokenChangeHistoryEntry) -> Result<(), HistoryError>;

    /// Fetch a page of entries matching `filter`, newest first.
    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage, HistoryError>;

    /// Delete every entry older than `cutoff`. Returns the number removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, HistoryError>;
}

/// In-memory implementation, for local development and tests.
pub mod memory {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::{ip_matches, ChangeHistoryStore, Cursor, HistoryFilter, HistoryPage};
    use crate::error::HistoryError;
    use crate::model::TokenChangeHistoryEntry;
    use chrono::{DateTime, Utc};

    struct Row {
        id: i64,
        entry: TokenChangeHistoryEntry,
    }

    /// An in-process implementation of [`ChangeHistoryStore`].
    pub struct MemoryHistoryStore {
        rows: Arc<RwLock<Vec<Row>>>,
        next_id: AtomicI64,
    }

    impl std::fmt::Debug for MemoryHistoryStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MemoryHistoryStore").finish_non_exhaustive()
        }
    }

    impl Default for MemoryHistoryStore {
        fn default() -> Self {
            Self {
                rows: Arc::new(RwLock::new(Vec::new())),
                next_id: AtomicI64::new(1),
            }
        }
    }

    impl MemoryHistoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl ChangeHistoryStore for MemoryHistoryStore {
        async fn add(&self, entry: &TokenChangeHistoryEntry) -> Result<(), HistoryError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.rows.write().await.push(Row {
                id,
                entry: entry.clone(),
            });
            Ok(())
        }

        async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage, HistoryError> {
            let rows = self.rows.read().await;
            let after = filter.cursor.as_deref().map(Cursor::decode).transpose()?;

            let mut matched: Vec<_> = rows
                .iter()
                .filter(|r| {
                    filter.username.as_deref().is_none_or(|u| u == r.entry.username)
                        && filter.key.as_deref().is_none_or(|k| {
                            r.entry.token == k || r.entry.parent.as_deref() == Some(k)
                        })
                        && filter.actor.as_deref().is_none_or(|a| a == r.entry.actor)
                        && filter.since.is_none_or(|s| r.entry.event_time >= s)
                        && filter.until.is_none_or(|u| r.entry.event_time <= u)
                        && filter.token_type.is_none_or(|t| t == r.entry.token_type)
                        && filter
                            .ip_or_cidr
                            .as_deref()
                            .is_none_or(|f| ip_matches(f, &r.entry.ip_address))
                })
                .collect();
            matched.sort_by_key(|r| std::cmp::Reverse((r.entry.event_time.timestamp(), r.id)));

            let filtered: Vec<_> = matched
                .into_iter()
                .filter(|r| {
                    after.is_none_or(|c| {
                        (r.entry.event_time.timestamp(), r.id) < (c.unix_seconds, c.id)
                    })
                })
                .collect();

            let total_count = filtered.len() as i64;
            let limit = if filter.limit > 0 { filter.limit as usize } else { filtered.len() };
            let page: Vec<_> = filtered.into_iter().take(limit).collect();

            let next_cursor = page.last().map(|r| {
                Cursor {
                    unix_seconds: r.entry.event_time.timestamp(),
                    id: r.id,
                }
                .encode()
            });

            Ok(HistoryPage {
                entries: page.into_iter().map(|r| r.entry.clone()).collect(),
                next_cursor,
                total_count,
            })
        }

        async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, HistoryError> {
            let mut rows = self.rows.write().await;
            let before = rows.len();
            rows.retain(|r| r.entry.event_time >= cutoff);
            Ok((before - rows.len()) as u64)
        }
    }
}

/// PostgreSQL-backed implementation.
pub mod postgres {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, Row};

    use super::{ChangeHistoryStore, Cursor, HistoryFilter, HistoryPage};
    use crate::error::HistoryError;
    use crate::model::{TokenChange, TokenChangeHistoryEntry, TokenType};

    /// A [`ChangeHistoryStore`] backed by a `token_change_history` table.
    #[derive(Clone)]
    pub struct PostgresHistoryStore {
        pool: PgPool,
    }

    impl std::fmt::Debug for PostgresHistoryStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PostgresHistoryStore").finish_non_exhaustive()
        }
    }

    impl PostgresHistoryStore {
        /// # Errors
        ///
        /// Returns [`HistoryError::Relational`] if connecting or migrating
        /// fails.
        pub async fn connect(database_url: &str) -> Result<Self, HistoryError> {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .map_err(|e| HistoryError::Relational(format!("connect failed: {e}")))?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS token_change_history (\
                    id             BIGSERIAL PRIMARY KEY, \
                    token          TEXT NOT NULL, \
                    username       TEXT NOT NULL, \
                    token_type     TEXT NOT NULL, \
                    token_name     TEXT, \
                    parent         TEXT, \
                    scopes         TEXT NOT NULL, \
                    service        TEXT, \
                    expires        TIMESTAMPTZ, \
                    actor          TEXT NOT NULL, \
                    action         TEXT NOT NULL, \
                    ip_address     TEXT NOT NULL, \
                    event_time     TIMESTAMPTZ NOT NULL, \
                    old_token_name TEXT, \
                    old_scopes     TEXT, \
                    old_expires    TIMESTAMPTZ\
                )",
            )
            .execute(&pool)
            .await
            .map_err(|e| HistoryError::Relational(format!("migration failed: {e}")))?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_history_username_time \
                 ON token_change_history (username, event_time DESC, id DESC)",
            )
            .execute(&pool)
            .await
            .map_err(|e| HistoryError::Relational(format!("index creation failed: {e}")))?;

            Ok(Self { pool })
        }
    }

    fn err(e: sqlx::Error) -> HistoryError {
        HistoryError::Relational(e.to_string())
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

    fn parse_token_type(s: &str) -> Result<TokenType, HistoryError> {
        match s {
            "session" => Ok(TokenType::Session),
            "user" => Ok(TokenType::User),
            "notebook" => Ok(TokenType::Notebook),
            "internal" => Ok(TokenType::Internal),
            "service" => Ok(TokenType::Service),
            other => Err(HistoryError::Relational(format!("unknown token_type '{other}'"))),
        }
    }

    fn action_str(a: TokenChange) -> &'static str {
        match a {
            TokenChange::Create => "create",
            TokenChange::Edit => "edit",
            TokenChange::Revoke => "revoke",
            TokenChange::Expire => "expire",
        }
    }

    fn parse_action(s: &str) -> Result<TokenChange, HistoryError> {
        match s {
            "create" => Ok(TokenChange::Create),
            "edit" => Ok(TokenChange::Edit),
            "revoke" => Ok(TokenChange::Revoke),
            "expire" => Ok(TokenChange::Expire),
            other => Err(HistoryError::Relational(format!("unknown action '{other}'"))),
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

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<(i64, TokenChangeHistoryEntry), HistoryError> {
        let id: i64 = row.try_get("id").map_err(err)?;
        let token_type_str: String = row.try_get("token_type").map_err(err)?;
        let action_str: String = row.try_get("action").map_err(err)?;
        let scopes_str: String = row.try_get("scopes").map_err(err)?;
        let old_scopes_str: Option<String> = row.try_get("old_scopes").map_err(err)?;
        let entry = TokenChangeHistoryEntry {
            token: row.try_get("token").map_err(err)?,
            username: row.try_get("username").map_err(err)?,
            token_type: parse_token_type(&token_type_str)?,
            token_name: row.try_get("token_name").map_err(err)?,
            parent: row.try_get("parent").map_err(err)?,
            scopes: split_scopes(&scopes_str),
            service: row.try_get("service").map_err(err)?,
            expires: row.try_get("expires").map_err(err)?,
            actor: row.try_get("actor").map_err(err)?,
            action: parse_action(&action_str)?,
            ip_address: row.try_get("ip_address").map_err(err)?,
            event_time: row.try_get("event_time").map_err(err)?,
            old_token_name: row.try_get("old_token_name").map_err(err)?,
            old_scopes: old_scopes_str.map(|s| split_scopes(&s)),
            old_expires: row.try_get("old_expires").map_err(err)?,
        };
        Ok((id, entry))
    }

    #[async_trait]
    impl ChangeHistoryStore for PostgresHistoryStore {
        async fn add(&self, entry: &TokenChangeHistoryEntry) -> Result<(), HistoryError> {
            sqlx::query(
                "INSERT INTO token_change_history \
                 (token, username, token_type, token_name, parent, scopes, service, expires, \
                  actor, action, ip_address, event_time, old_token_name, old_scopes, old_expires) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
            )
            .bind(&entry.token)
            .bind(&entry.username)
            .bind(token_type_str(entry.token_type))
            .bind(&entry.token_name)
            .bind(&entry.parent)
            .bind(join_scopes(&entry.scopes))
            .bind(&entry.service)
            .bind(entry.expires)
            .bind(&entry.actor)
            .bind(action_str(entry.action))
            .bind(&entry.ip_address)
            .bind(entry.event_time)
            .bind(&entry.old_token_name)
            .bind(entry.old_scopes.as_ref().map(|s| join_scopes(s)))
            .bind(entry.old_expires)
            .execute(&self.pool)
            .await
            .map_err(err)?;
            Ok(())
        }

        async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage, HistoryError> {
            let after = filter.cursor.as_deref().map(Cursor::decode).transpose()?;
            let (after_secs, after_id) = after
                .map(|c| (Some(c.unix_seconds), Some(c.id)))
                .unwrap_or((None, None));
            let token_type = filter.token_type.map(token_type_str);

            const WHERE: &str = "WHERE ($1::TEXT IS NULL OR username = $1) \
                   AND ($2::TEXT IS NULL OR token = $2 OR parent = $2) \
                   AND ($3::TEXT IS NULL OR actor = $3) \
                   AND ($4::TIMESTAMPTZ IS NULL OR event_time >= $4) \
                   AND ($5::TIMESTAMPTZ IS NULL OR event_time <= $5) \
                   AND ($6::TEXT IS NULL OR token_type = $6) \
                   AND ($7::TEXT IS NULL OR ip_address::inet <<= $7::inet)";

            let total_count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM token_change_history {WHERE}"))
                .bind(&filter.username)
                .bind(&filter.key)
                .bind(&filter.actor)
                .bind(filter.since)
                .bind(filter.until)
                .bind(token_type)
                .bind(&filter.ip_or_cidr)
                .fetch_one(&self.pool)
                .await
                .map_err(err)?
                .try_get("n")
                .map_err(err)?;

            let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };
            let rows = sqlx::query(&format!(
                "SELECT * FROM token_change_history {WHERE} \
                   AND ($8::BIGINT IS NULL OR \
                        (EXTRACT(EPOCH FROM event_time)::BIGINT, id) < ($8, $9)) \
                 ORDER BY event_time DESC, id DESC \
                 LIMIT $10"
            ))
            .bind(&filter.username)
            .bind(&filter.key)
            .bind(&filter.actor)
            .bind(filter.since)
            .bind(filter.until)
            .bind(token_type)
            .bind(&filter.ip_or_cidr)
            .bind(after_secs)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(err)?;

            let decoded = rows
                .iter()
                .map(row_to_entry)
                .collect::<Result<Vec<_>, _>>()?;

            let next_cursor = decoded.last().map(|(id, entry)| {
                Cursor {
                    unix_seconds: entry.event_time.timestamp(),
                    id: *id,
                }
                .encode()
            });

            Ok(HistoryPage {
                entries: decoded.into_iter().map(|(_, e)| e).collect(),
                next_cursor,
                total_count,
            })
        }

        async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, HistoryError> {
            let result = sqlx::query("DELETE FROM token_change_history WHERE event_time < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(err)?;
            Ok(result.rows_affected())
        }
    }
}

pub use memory::MemoryHistoryStore;
pub use postgres::PostgresHistoryStore;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TokenChange, TokenType};

    fn entry(token: &str, username: &str, when: DateTime<Utc>) -> TokenChangeHistoryEntry {
        TokenChangeHistoryEntry {
            token: token.to_owned(),
            username: username.to_owned(),
            token_type: TokenType::User,
            token_name: None,
            parent: None,
            scopes: vec![],
            service: None,
            expires: None,
            actor: username.to_owned(),
            action: TokenChange::Create,
            ip_address: "127.0.0.1".to_owned(),
            event_time: when,
            old_token_name: None,
            old_scopes: None,
            old_expires: None,
        }
    }

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor { unix_seconds: 1_700_000_000, id: 42 };
        let encoded = cursor.encode();
        assert_eq!(encoded, "1700000000_42");
        assert_eq!(Cursor::decode(&encoded).unwrap(), cursor);
    }

    #[test]
    fn cursor_decode_rejects_malformed_input() {
        assert!(Cursor::decode("not-a-cursor").is_err());
        assert!(Cursor::decode("abc_def").is_err());
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let store = memory::MemoryHistoryStore::new();
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let t1 = Utc::now() - chrono::Duration::hours(1);
        store.add(&entry("k1", "alice", t0)).await.unwrap();
        store.add(&entry("k2", "alice", t1)).await.unwrap();

        let page = store.list(&HistoryFilter::default()).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].token, "k2");
        assert_eq!(page.entries[1].token, "k1");
        assert_eq!(page.total_count, 2);
    }

    #[tokio::test]
    async fn list_paginates_via_cursor() {
        let store = memory::MemoryHistoryStore::new();
        for i in 0..5 {
            let when = Utc::now() - chrono::Duration::minutes(i);
            store.add(&entry(&format!("k{i}"), "alice", when)).await.unwrap();
        }

        let first = store
            .list(&HistoryFilter {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.next_cursor.is_some());

        let second = store
            .list(&HistoryFilter {
                limit: 2,
                cursor: first.next_cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 2);
        assert_ne!(first.entries[0].token, second.entries[0].token);
    }

    #[tokio::test]
    async fn list_key_filter_matches_token_and_one_level_children() {
        let store = memory::MemoryHistoryStore::new();
        let now = Utc::now();
        let mut parent_entry = entry("parent", "alice", now);
        parent_entry.parent = None;
        store.add(&parent_entry).await.unwrap();

        let mut child_entry = entry("child", "alice", now);
        child_entry.parent = Some("parent".to_owned());
        store.add(&child_entry).await.unwrap();

        let mut grandchild_entry = entry("grandchild", "alice", now);
        grandchild_entry.parent = Some("child".to_owned());
        store.add(&grandchild_entry).await.unwrap();

        let page = store
            .list(&HistoryFilter {
                key: Some("parent".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        let tokens: Vec<_> = page.entries.iter().map(|e| e.token.clone()).collect();
        assert!(tokens.contains(&"parent".to_owned()));
        assert!(tokens.contains(&"child".to_owned()));
        assert!(!tokens.contains(&"grandchild".to_owned()));
    }

    #[tokio::test]
    async fn list_filters_by_actor_and_time_range_and_type() {
        let store = memory::MemoryHistoryStore::new();
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let t1 = Utc::now() - chrono::Duration::hours(1);

        let mut by_alice = entry("k1", "alice", t0);
        by_alice.actor = "alice".to_owned();
        by_alice.token_type = TokenType::User;
        store.add(&by_alice).await.unwrap();

        let mut by_admin = entry("k2", "bob", t1);
        by_admin.actor = "admin".to_owned();
        by_admin.token_type = TokenType::Service;
        store.add(&by_admin).await.unwrap();

        let page = store
            .list(&HistoryFilter {
                actor: Some("admin".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].token, "k2");

        let page = store
            .list(&HistoryFilter {
                since: Some(t0 + chrono::Duration::minutes(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].token, "k2");

        let page = store
            .list(&HistoryFilter {
                token_type: Some(TokenType::Service),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].token, "k2");
    }

    #[tokio::test]
    async fn list_filters_by_ip_or_cidr() {
        let store = memory::MemoryHistoryStore::new();
        let now = Utc::now();

        let mut inside = entry("k1", "alice", now);
        inside.ip_address = "10.0.0.5".to_owned();
        store.add(&inside).await.unwrap();

        let mut outside = entry("k2", "alice", now);
        outside.ip_address = "192.168.1.1".to_owned();
        store.add(&outside).await.unwrap();

        let page = store
            .list(&HistoryFilter {
                ip_or_cidr: Some("10.0.0.0/8".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].token, "k1");

        let page = store
            .list(&HistoryFilter {
                ip_or_cidr: Some("192.168.1.1".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].token, "k2");
    }

    #[test]
    fn ip_matches_exact_and_cidr() {
        assert!(ip_matches("127.0.0.1", "127.0.0.1"));
        assert!(!ip_matches("127.0.0.1", "127.0.0.2"));
        assert!(ip_matches("10.0.0.0/8", "10.1.2.3"));
        assert!(!ip_matches("10.0.0.0/8", "192.168.1.1"));
    }

    #[tokio::test]
    async fn delete_older_than_removes_only_old_rows() {
        let store = memory::MemoryHistoryStore::new();
        let old = Utc::now() - chrono::Duration::days(400);
        let recent = Utc::now();
        store.add(&entry("k1", "alice", old)).await.unwrap();
        store.add(&entry("k2", "alice", recent)).await.unwrap();

        let removed = store
            .delete_older_than(Utc::now() - chrono::Duration::days(180))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = store.list(&HistoryFilter::default()).await.unwrap();
        assert_eq!(remaining.entries.len(), 1);
        assert_eq!(remaining.entries[0].token, "k2");
    }
}
