//! Shared application state for the Gafaelfawr server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the token service (which in turn owns
//! the derived-token cache), the OIDC provider, and the bootstrap token (if
//! configured).

use std::sync::Arc;

use gafaelfawr_core::{OidcProvider, TokenService};

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Token creation, lookup, modification, and revocation.
    pub token_service: Arc<TokenService>,
    /// The minimal OIDC authorization-code provider.
    pub oidc: Arc<OidcProvider>,
    /// A configured out-of-band bootstrap token, if any. Presenting it
    /// grants a synthetic `admin:token` identity under actor `<bootstrap>`.
    pub bootstrap_token: Option<String>,
    /// Base URL this server is reachable at, used to build discovery
    /// document and redirect URLs.
    pub base_url: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
