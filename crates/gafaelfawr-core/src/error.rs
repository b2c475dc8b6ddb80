//! Domain errors for the token service, history store, and OIDC provider.

use thiserror::Error;

use gafaelfawr_storage::StorageError;

/// Errors from authorization checks shared across token operations.
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Errors from token creation, lookup, modification, and deletion.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("token not found")]
    NotFound,

    #[error("requested scopes are broader than your current scopes")]
    ScopesTooBroad,

    #[error("unknown scopes requested")]
    UnknownScopes,

    #[error("token must be valid for at least five minutes")]
    ExpiresTooSoon,

    #[error("invalid IP address or CIDR block: {0}")]
    InvalidIpAddress(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("a token named '{0}' already exists for this user")]
    DuplicateTokenName(String),

    #[error("only user tokens can be modified")]
    NotModifiable,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("relational store error: {0}")]
    Relational(String),
}

/// Errors from the change-history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("relational store error: {0}")]
    Relational(String),

    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(String),
}

/// Errors from the OIDC authorization-code provider.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("invalid_client")]
    InvalidClient,

    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    #[error("unsupported_grant_type")]
    UnsupportedGrantType,

    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to mint token: {0}")]
    SigningFailed(String),
}

impl OidcError {
    /// The OAuth 2.0 `error` field this maps to (RFC 6749 §5.2).
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidClient => "invalid_client",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::Storage(_) | Self::SigningFailed(_) => "server_error",
        }
    }

    /// Whether the detailed message should be hidden from the client and
    /// replaced with the bare error code, matching the upstream behavior of
    /// not leaking internal failure detail for server-side errors.
    #[must_use]
    pub fn hide_detail(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::SigningFailed(_))
    }
}

/// Errors from the single-flight token derivation cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Token(#[from] TokenError),
}
