//! Admin-only routes: minting a token on another user's behalf.

use std::sync::Arc;

use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gafaelfawr_core::{AdminCreateRequest, AuthData, TokenType};

use crate::error::AppError;
use crate::middleware::{auth_gate, AuthContext, AuthGateOptions};
use crate::routes::client_ip;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let opts = AuthGateOptions::require_scope("admin:token").allowing_bootstrap();
    Router::new()
        .route("/auth/api/v1/tokens", post(create_from_admin))
        .layer(from_fn_with_state(state, move |s, req, next| {
            auth_gate(s, opts, req, next)
        }))
}

#[derive(Debug, Deserialize)]
struct AdminCreateTokenRequest {
    username: String,
    token_type: TokenType,
    token_name: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
    name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    uid: i64,
    gid: Option<i64>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateTokenResponse {
    token: String,
}

/// `POST /auth/api/v1/tokens` — mint a token on another user's behalf.
/// Requires `admin:token`.
async fn create_from_admin(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(request): Json<AdminCreateTokenRequest>,
) -> Result<Response, AppError> {
    let auth = AuthData {
        username: ctx.username.clone(),
        scopes: ctx.scopes.clone(),
    };
    let ip_address = client_ip(&headers);
    let token = state
        .token_service
        .create_from_admin_request(
            &AdminCreateRequest {
                username: request.username,
                token_type: request.token_type,
                token_name: request.token_name,
                scopes: request.scopes,
                expires: request.expires,
                name: request.name,
                email: request.email,
                uid: request.uid,
                gid: request.gid,
                groups: request.groups,
            },
            &auth,
            &ip_address,
        )
        .await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: token.to_bearer_string(),
        }),
    )
        .into_response())
}
