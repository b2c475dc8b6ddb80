//! Core library for Gafaelfawr: the token data model, the dual-store token
//! service, the change-history log, the single-flight token cache, and the
//! OIDC authorization-code provider.
//!
//! This crate knows nothing about HTTP; `gafaelfawr-server` wires it into
//! Axum routes and middleware.

pub mod cache;
pub mod error;
pub mod history;
pub mod kv_store;
pub mod model;
pub mod oidc;
pub mod relational_store;
pub mod service;

pub use cache::{DerivedKey, DerivedKind, TokenCache};
pub use error::{AuthorizationError, CacheError, HistoryError, OidcError, TokenError};
pub use history::{ChangeHistoryStore, HistoryFilter, HistoryPage, MemoryHistoryStore, PostgresHistoryStore};
pub use kv_store::KvTokenStore;
pub use model::{
    Token, TokenChange, TokenChangeHistoryEntry, TokenData, TokenInfo, TokenType, UserMetadata,
    INTERNAL_ACTOR,
};
pub use oidc::{IdTokenClaims, OidcClient, OidcConfig, OidcProvider, OidcTokenReply};
pub use relational_store::{
    MemoryRelationalStore, PostgresRelationalStore, RelationalTokenStore, TokenFilter, TokenInfoUpdate,
};
pub use service::{
    validate_ip_or_cidr, AdminCreateRequest, AuditAlert, AuthData, TokenService, TokenServiceConfig,
};
