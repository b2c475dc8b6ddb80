//! The token data model.
//!
//! A [`Token`] is the bearer credential a client presents; [`TokenData`] is
//! what the KV store holds for it; [`TokenInfo`] is what the relational
//! store holds. The two overlap but are not identical — see the module-level
//! docs on [`crate::kv_store`] and [`crate::relational_store`] for why they
//! are kept as separate types instead of one shared struct.

use std::fmt;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix for a bearer token's wire form.
pub const TOKEN_PREFIX: &str = "gt-";

/// Prefix for an OIDC authorization code's wire form.
pub const CODE_PREFIX: &str = "gc-";

const RANDOM_BYTE_LEN: usize = 16;

/// An opaque bearer credential: a public `key` and a secret `secret`.
///
/// The wire form is `"<prefix>"+key+"."+secret`. Keys are stored in the
/// clear (they are the lookup index); secrets are never persisted in the
/// clear outside the entry they authenticate, and are compared in constant
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub key: String,
    pub secret: String,
}

impl Token {
    /// Mint a new random token (22 url-safe base64 characters per field,
    /// encoding 128 random bits each).
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: random_urlsafe_string(),
            secret: random_urlsafe_string(),
        }
    }

    /// Render the bearer wire form: `gt-<key>.<secret>`.
    #[must_use]
    pub fn to_bearer_string(&self) -> String {
        format!("{TOKEN_PREFIX}{}.{}", self.key, self.secret)
    }

    /// Render the OIDC authorization code wire form: `gc-<key>.<secret>`.
    #[must_use]
    pub fn to_code_string(&self) -> String {
        format!("{CODE_PREFIX}{}.{}", self.key, self.secret)
    }

    /// Parse a bearer wire-form string, validating the `gt-` prefix.
    #[must_use]
    pub fn parse_bearer(s: &str) -> Option<Self> {
        Self::parse_with_prefix(s, TOKEN_PREFIX)
    }

    /// Parse an OIDC code wire-form string, validating the `gc-` prefix.
    #[must_use]
    pub fn parse_code(s: &str) -> Option<Self> {
        Self::parse_with_prefix(s, CODE_PREFIX)
    }

    fn parse_with_prefix(s: &str, prefix: &str) -> Option<Self> {
        let rest = s.strip_prefix(prefix)?;
        let (key, secret) = rest.split_once('.')?;
        if key.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_owned(),
            secret: secret.to_owned(),
        })
    }

    /// Hex-encoded SHA-256 digest of the secret, suitable for storage
    /// alongside the key so the plaintext secret never needs to round-trip
    /// through the store.
    #[must_use]
    pub fn hash_secret(&self) -> String {
        hash_secret(&self.secret)
    }

    /// Constant-time comparison of this token's secret against a stored
    /// secret hash.
    #[must_use]
    pub fn secret_matches_hash(&self, stored_hash: &str) -> bool {
        let computed = self.hash_secret();
        computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

fn random_urlsafe_string() -> String {
    let mut bytes = [0u8; RANDOM_BYTE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex-encoded SHA-256 of a secret string.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// The kind of principal a token represents and how it came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Minted at login; root of a browser session's derived tokens.
    Session,
    /// User-minted, long-lived, identified by a human-chosen name.
    User,
    /// Derived delegation token inheriting the parent's scopes unreduced.
    Notebook,
    /// Derived delegation token bound to a specific downstream service.
    Internal,
    /// Admin-minted token for a non-human (`bot-*`) principal.
    Service,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::User => "user",
            Self::Notebook => "notebook",
            Self::Internal => "internal",
            Self::Service => "service",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of the user-identity fields carried on a token, taken at
/// creation time from the upstream identity provider (or, for derived
/// tokens, inherited from the parent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub name: Option<String>,
    pub email: Option<String>,
    pub uid: i64,
    pub gid: Option<i64>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// What the KV token store holds: the live, authoritative payload for a
/// token. Field names are serialized verbatim (JSON) and must not be
/// renamed — the audit pass compares this structure byte-for-byte with the
/// relational side on the overlapping fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub token_key: String,
    pub username: String,
    pub token_type: TokenType,
    /// Always stored sorted lexicographically (invariant I2).
    pub scopes: Vec<String>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub user_metadata: UserMetadata,
}

impl TokenData {
    /// TTL to hand the KV store when writing this entry: `max(expires-now, 0)`,
    /// or `None` when the token does not expire.
    #[must_use]
    pub fn kv_ttl(&self) -> Option<chrono::Duration> {
        self.expires.map(|exp| {
            let remaining = exp - Utc::now();
            if remaining < chrono::Duration::zero() {
                chrono::Duration::zero()
            } else {
                remaining
            }
        })
    }
}

/// What the relational store holds: the durable index over tokens, with the
/// extra fields (`token_name`, `parent`, `service`) that only live here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_key: String,
    pub username: String,
    pub token_type: TokenType,
    pub scopes: Vec<String>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    /// Human-chosen name, present only for `TokenType::User`.
    pub token_name: Option<String>,
    /// Key of the parent token, present only for derived types.
    pub parent: Option<String>,
    /// Downstream service name, present only for `TokenType::Internal`.
    pub service: Option<String>,
}

/// The action recorded by a [`TokenChangeHistoryEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenChange {
    Create,
    Edit,
    Revoke,
    Expire,
}

/// The actor name recorded for changes made by a background sweep rather
/// than an authenticated caller.
pub const INTERNAL_ACTOR: &str = "<internal>";

/// One append-only row in the change-history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenChangeHistoryEntry {
    pub token: String,
    pub username: String,
    pub token_type: TokenType,
    pub token_name: Option<String>,
    pub parent: Option<String>,
    pub scopes: Vec<String>,
    pub service: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub actor: String,
    pub action: TokenChange,
    pub ip_address: String,
    pub event_time: DateTime<Utc>,
    pub old_token_name: Option<String>,
    pub old_scopes: Option<Vec<String>>,
    pub old_expires: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_bearer_wire_form() {
        let token = Token::new();
        let wire = token.to_bearer_string();
        assert!(wire.starts_with(TOKEN_PREFIX));
        let parsed = Token::parse_bearer(&wire).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn token_round_trips_through_code_wire_form() {
        let token = Token::new();
        let wire = token.to_code_string();
        assert!(wire.starts_with(CODE_PREFIX));
        let parsed = Token::parse_code(&wire).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn parse_bearer_rejects_wrong_prefix() {
        let token = Token::new();
        let wire = token.to_code_string();
        assert!(Token::parse_bearer(&wire).is_none());
    }

    #[test]
    fn parse_bearer_rejects_missing_dot() {
        assert!(Token::parse_bearer("gt-onlykey").is_none());
    }

    #[test]
    fn secret_matches_hash_round_trips() {
        let token = Token::new();
        let hash = token.hash_secret();
        assert!(token.secret_matches_hash(&hash));
    }

    #[test]
    fn secret_matches_hash_rejects_wrong_secret() {
        let token = Token::new();
        let other = Token::new();
        assert!(!token.secret_matches_hash(&other.hash_secret()));
    }

    #[test]
    fn kv_ttl_is_zero_for_past_expiry() {
        let mut data = sample_token_data();
        data.expires = Some(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(data.kv_ttl(), Some(chrono::Duration::zero()));
    }

    #[test]
    fn kv_ttl_is_none_when_expires_is_none() {
        let mut data = sample_token_data();
        data.expires = None;
        assert_eq!(data.kv_ttl(), None);
    }

    fn sample_token_data() -> TokenData {
        TokenData {
            token_key: "k".to_owned(),
            username: "alice".to_owned(),
            token_type: TokenType::User,
            scopes: vec!["read:all".to_owned()],
            created: Utc::now(),
            expires: None,
            user_metadata: UserMetadata {
                name: Some("Alice Example".to_owned()),
                email: None,
                uid: 1000,
                gid: None,
                groups: vec![],
            },
        }
    }
}
