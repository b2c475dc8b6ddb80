//! Token CRUD routes: `/auth/api/v1/token-info`, `/auth/api/v1/user-info`,
//! and `/auth/api/v1/users/{username}/tokens*`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gafaelfawr_core::{AuthData, TokenInfo};

use crate::error::AppError;
use crate::middleware::{auth_gate, AuthContext, AuthGateOptions};
use crate::routes::client_ip;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/api/v1/token-info", get(token_info))
        .route("/auth/api/v1/user-info", get(user_info))
        .route(
            "/auth/api/v1/users/{username}/tokens",
            get(list_tokens).post(create_token),
        )
        .route(
            "/auth/api/v1/users/{username}/tokens/{key}",
            get(get_token).patch(modify_token).delete(delete_token),
        )
        .route(
            "/auth/api/v1/users/{username}/token-change-history",
            get(super::history::user_history),
        )
        .route(
            "/auth/api/v1/users/{username}/tokens/{key}/change-history",
            get(super::history::token_history),
        )
        .layer(from_fn_with_state(state, move |s, req, next| {
            auth_gate(s, AuthGateOptions::default(), req, next)
        }))
}

fn auth_data(ctx: &AuthContext) -> AuthData {
    AuthData {
        username: ctx.username.clone(),
        scopes: ctx.scopes.clone(),
    }
}

/// `GET /auth/api/v1/token-info` — metadata for the presented token itself.
async fn token_info(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<TokenInfo>, AppError> {
    let Some(key) = ctx.token_key.clone() else {
        return Err(AppError::BadRequest(
            "the bootstrap token has no token-info".to_owned(),
        ));
    };
    let auth = auth_data(&ctx);
    let info = state
        .token_service
        .get_token_info(&key, &auth, None)
        .await?
        .ok_or_else(|| AppError::NotFound("token not found".to_owned()))?;
    Ok(Json(info))
}

#[derive(Debug, Serialize)]
struct UserInfoResponse {
    username: String,
    name: Option<String>,
    email: Option<String>,
    uid: i64,
    gid: Option<i64>,
    groups: Vec<String>,
}

/// `GET /auth/api/v1/user-info` — the user metadata snapshotted on the
/// presented token.
async fn user_info(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<UserInfoResponse>, AppError> {
    let Some(key) = ctx.token_key.clone() else {
        return Err(AppError::BadRequest(
            "the bootstrap token has no user-info".to_owned(),
        ));
    };
    let data = state
        .token_service
        .get_data_by_key(&key)
        .await?
        .ok_or_else(|| AppError::NotFound("token not found".to_owned()))?;
    Ok(Json(UserInfoResponse {
        username: data.username,
        name: data.user_metadata.name,
        email: data.user_metadata.email,
        uid: data.user_metadata.uid,
        gid: data.user_metadata.gid,
        groups: data.user_metadata.groups,
    }))
}

/// `GET /auth/api/v1/users/{username}/tokens` — list a user's tokens.
async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(username): Path<String>,
) -> Result<Json<Vec<TokenInfo>>, AppError> {
    let auth = auth_data(&ctx);
    let tokens = state.token_service.list_tokens(&auth, Some(&username)).await?;
    Ok(Json(tokens))
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    token_name: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateTokenResponse {
    token: String,
}

/// `POST /auth/api/v1/users/{username}/tokens` — create a user token.
async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(username): Path<String>,
    headers: axum::http::HeaderMap,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Response, AppError> {
    let auth = auth_data(&ctx);
    let ip_address = client_ip(&headers);
    let token = state
        .token_service
        .create_user_token(
            &auth,
            &username,
            &request.token_name,
            request.scopes,
            request.expires,
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

/// `GET /auth/api/v1/users/{username}/tokens/{key}` — fetch one token.
async fn get_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((username, key)): Path<(String, String)>,
) -> Result<Json<TokenInfo>, AppError> {
    let auth = auth_data(&ctx);
    let info = state
        .token_service
        .get_token_info(&key, &auth, Some(&username))
        .await?
        .ok_or_else(|| AppError::NotFound("token not found".to_owned()))?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize, Default)]
struct ModifyTokenRequest {
    token_name: Option<String>,
    scopes: Option<Vec<String>>,
    expires: Option<DateTime<Utc>>,
    #[serde(default)]
    no_expire: bool,
}

/// `PATCH /auth/api/v1/users/{username}/tokens/{key}` — modify a user
/// token's name, scopes, or expiration.
async fn modify_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((username, key)): Path<(String, String)>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ModifyTokenRequest>,
) -> Result<Json<TokenInfo>, AppError> {
    let existing = state
        .token_service
        .get_token_info(&key, &auth_data(&ctx), Some(&username))
        .await?;
    if existing.is_none() {
        return Err(AppError::NotFound("token not found".to_owned()));
    }

    let auth = auth_data(&ctx);
    let ip_address = client_ip(&headers);
    let info = state
        .token_service
        .modify(
            &key,
            &auth,
            &ip_address,
            request.token_name,
            request.scopes,
            request.expires,
            request.no_expire,
        )
        .await?;
    Ok(Json(info))
}

/// `DELETE /auth/api/v1/users/{username}/tokens/{key}` — revoke a token,
/// cascading to its children.
async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((username, key)): Path<(String, String)>,
    headers: axum::http::HeaderMap,
) -> Result<axum::http::StatusCode, AppError> {
    let auth = auth_data(&ctx);
    let ip_address = client_ip(&headers);
    let deleted = state
        .token_service
        .delete(&key, &auth, Some(&username), &ip_address)
        .await?;
    if deleted {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("token not found".to_owned()))
    }
}
