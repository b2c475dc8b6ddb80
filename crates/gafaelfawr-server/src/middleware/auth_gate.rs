//! Authorization gate for Gafaelfawr routes.
//!
//! Extracts a bearer token (or, for bootstrap deployments, a fixed shared
//! secret) from the request, validates it against the token service, and
//! injects an [`AuthContext`] into request extensions for downstream
//! handlers. Individual routers attach this gate via
//! `axum::middleware::from_fn_with_state` with an [`AuthGateOptions`]
//! describing what that particular route requires.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use gafaelfawr_core::{Token, TokenType};

use crate::state::AppState;

/// Synthetic actor name attributed to change-history entries produced by
/// requests authenticated with the bootstrap shared secret. Distinct from
/// `gafaelfawr_core::INTERNAL_ACTOR`, which is reserved for background sweep
/// workers.
const BOOTSTRAP_ACTOR: &str = "<bootstrap>";

/// Authentication context injected into request extensions by [`auth_gate`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated username.
    pub username: String,
    /// Scopes granted to the presented token.
    pub scopes: Vec<String>,
    /// The token's key, for audit logging. `None` for the synthetic
    /// bootstrap identity, which has no backing token.
    pub token_key: Option<String>,
    /// The type of the presented token. `None` for the bootstrap identity.
    pub token_type: Option<TokenType>,
}

impl AuthContext {
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        self.token_key.is_none()
    }
}

/// Per-route requirements enforced by [`auth_gate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthGateOptions {
    /// If set, the presented token must carry this scope or the request is
    /// rejected with 403.
    pub require_scope: Option<&'static str>,
    /// If true, a bootstrap token presented as a bearer credential is
    /// accepted and mapped to a synthetic admin identity.
    pub allow_bootstrap_token: bool,
    /// If true, only session tokens are accepted; any other token type is
    /// rejected with 401.
    pub require_session: bool,
}

impl AuthGateOptions {
    #[must_use]
    pub fn require_scope(scope: &'static str) -> Self {
        Self {
            require_scope: Some(scope),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn allowing_bootstrap(mut self) -> Self {
        self.allow_bootstrap_token = true;
        self
    }

    #[must_use]
    pub fn requiring_session(mut self) -> Self {
        self.require_session = true;
        self
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"error": "unauthorized", "message": message})),
    )
        .into_response()
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        axum::Json(serde_json::json!({"error": "forbidden", "message": message})),
    )
        .into_response()
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Validate the request's credentials and inject an [`AuthContext`].
///
/// Routers attach this with a fixed set of `opts` via a closure, e.g.
/// `axum::middleware::from_fn_with_state(state, move |s, req, next| auth_gate(s, opts, req, next))`.
pub async fn auth_gate(
    State(state): State<Arc<AppState>>,
    opts: AuthGateOptions,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(raw) = bearer_token(&req) else {
        return unauthorized("missing bearer token");
    };

    if opts.allow_bootstrap_token {
        if let Some(bootstrap) = &state.bootstrap_token {
            if raw == *bootstrap {
                let ctx = AuthContext {
                    username: BOOTSTRAP_ACTOR.to_owned(),
                    scopes: vec!["admin:token".to_owned()],
                    token_key: None,
                    token_type: None,
                };
                req.extensions_mut().insert(ctx);
                return next.run(req).await;
            }
        }
    }

    let Some(token) = Token::parse_bearer(&raw) else {
        return unauthorized("malformed token");
    };

    let data = match state.token_service.get_data(&token).await {
        Ok(Some(data)) => data,
        Ok(None) => return unauthorized("invalid or expired token"),
        Err(_) => return unauthorized("invalid or expired token"),
    };

    if opts.require_session && data.token_type != TokenType::Session {
        return unauthorized("a session token is required");
    }

    if let Some(scope) = opts.require_scope {
        if !data.scopes.iter().any(|s| s == scope) {
            return forbidden("token does not carry the required scope");
        }
    }

    let ctx = AuthContext {
        username: data.username.clone(),
        scopes: data.scopes.clone(),
        token_key: Some(data.token_key.clone()),
        token_type: Some(data.token_type),
    };
    req.extensions_mut().insert(ctx);
    next.run(req).await
}
