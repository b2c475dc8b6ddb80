//! Change-history routes: per-user, per-token, and global.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gafaelfawr_core::{validate_ip_or_cidr, HistoryFilter, HistoryPage, TokenType};

use crate::error::AppError;
use crate::middleware::{auth_gate, AuthContext, AuthGateOptions};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/api/v1/history/token-changes", get(global_history))
        .layer(from_fn_with_state(state, move |s, req, next| {
            auth_gate(s, AuthGateOptions::default(), req, next)
        }))
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    cursor: Option<String>,
    #[serde(default)]
    limit: i64,
    actor: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    token_type: Option<TokenType>,
    ip_address: Option<String>,
}

impl HistoryQuery {
    fn filter(&self, username: Option<String>, key: Option<String>) -> HistoryFilter {
        HistoryFilter {
            username,
            key,
            actor: self.actor.clone(),
            since: self.since,
            until: self.until,
            token_type: self.token_type,
            ip_or_cidr: self.ip_address.clone(),
            cursor: self.cursor.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    #[serde(flatten)]
    page: HistoryPage,
}

fn paginated_response(base_path: &str, query: &HistoryQuery, page: HistoryPage) -> Response {
    let total = page.total_count;
    let next = page.next_cursor.clone();
    let mut response = Json(HistoryResponse { page }).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = header::HeaderValue::from_str(&total.to_string()) {
        headers.insert("X-Total-Count", value);
    }
    if let Some(cursor) = next {
        let link = format!(
            "<{base_path}?cursor={cursor}&limit={}>; rel=\"next\"",
            if query.limit > 0 { query.limit } else { 0 }
        );
        if let Ok(value) = header::HeaderValue::from_str(&link) {
            headers.insert(header::LINK, value);
        }
    }
    response
}

/// `GET /auth/api/v1/users/{username}/token-change-history` — events for
/// every token owned by `username`.
pub(crate) async fn user_history(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(username): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, AppError> {
    if ctx.username != username && !ctx.has_scope("admin:token") {
        return Err(AppError::Forbidden(
            "only the owner or an admin may view this history".to_owned(),
        ));
    }
    validate_query_ip(&query)?;
    let page = state
        .token_service
        .get_change_history(&query.filter(Some(username.clone()), None))
        .await?;
    Ok(paginated_response(
        &format!("/auth/api/v1/users/{username}/token-change-history"),
        &query,
        page,
    ))
}

/// `GET /auth/api/v1/users/{username}/tokens/{key}/change-history` — events
/// for one token.
pub(crate) async fn token_history(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((username, key)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, AppError> {
    if ctx.username != username && !ctx.has_scope("admin:token") {
        return Err(AppError::Forbidden(
            "only the owner or an admin may view this history".to_owned(),
        ));
    }
    validate_query_ip(&query)?;
    let page = state
        .token_service
        .get_change_history(&query.filter(None, Some(key.clone())))
        .await?;
    Ok(paginated_response(
        &format!("/auth/api/v1/users/{username}/tokens/{key}/change-history"),
        &query,
        page,
    ))
}

/// `GET /auth/api/v1/history/token-changes` — global change-history feed.
/// Requires `admin:token`.
async fn global_history(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, AppError> {
    if !ctx.has_scope("admin:token") {
        return Err(AppError::Forbidden("global history requires admin:token".to_owned()));
    }
    validate_query_ip(&query)?;
    let page = state
        .token_service
        .get_change_history(&query.filter(None, None))
        .await?;
    Ok(paginated_response("/auth/api/v1/history/token-changes", &query, page))
}

fn validate_query_ip(query: &HistoryQuery) -> Result<(), AppError> {
    if let Some(ip) = &query.ip_address {
        validate_ip_or_cidr(ip).map_err(|_| AppError::BadRequest(format!("invalid ip_address filter: {ip}")))?;
    }
    Ok(())
}
