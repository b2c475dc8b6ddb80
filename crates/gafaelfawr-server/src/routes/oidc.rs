//! OIDC provider routes: `/auth/openid/*` and the `/.well-known/*` discovery
//! documents.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use gafaelfawr_core::Token;

use crate::middleware::{auth_gate, AuthContext, AuthGateOptions};
use crate::state::AppState;

/// Build the OIDC provider router, mounted at the server root.
pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let login_opts = AuthGateOptions::default().requiring_session();
    let login = Router::new()
        .route("/auth/openid/login", get(login_handler))
        .layer(from_fn_with_state(state.clone(), move |s, req, next| {
            auth_gate(s, login_opts, req, next)
        }));

    let userinfo = Router::new().route("/auth/openid/userinfo", get(userinfo_handler));

    Router::new()
        .merge(login)
        .merge(userinfo)
        .route("/auth/openid/token", post(token_handler))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route(
            "/.well-known/openid-configuration",
            get(openid_configuration_handler),
        )
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    client_id: String,
    response_type: String,
    scope: String,
    redirect_uri: String,
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorPage {
    error: &'static str,
    message: String,
}

fn error_redirect(redirect_uri: &str, error: &'static str, description: &str) -> Response {
    let mut url = redirect_uri.to_owned();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str("error=");
    url.push_str(error);
    url.push_str("&error_description=");
    url.push_str(&urlencoding::encode(description));
    Redirect::to(&url).into_response()
}

/// `GET /auth/openid/login` — validate the request and redirect with a
/// freshly minted authorization code. Only an unknown `client_id` is
/// rendered as a page; every other failure redirects back to the caller.
async fn login_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(ctx): axum::Extension<AuthContext>,
    Query(query): Query<LoginQuery>,
) -> Response {
    if !state.oidc.is_valid_client(&query.client_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorPage {
                error: "invalid_client",
                message: "unknown client_id".to_owned(),
            }),
        )
            .into_response();
    }

    if !state.oidc.redirect_uri_allowed(&query.client_id, &query.redirect_uri) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorPage {
                error: "invalid_request",
                message: "redirect_uri is not registered for this client".to_owned(),
            }),
        )
            .into_response();
    }

    if query.response_type != "code" {
        return error_redirect(&query.redirect_uri, "invalid_request", "response_type must be code");
    }
    if query.scope != "openid" {
        return error_redirect(&query.redirect_uri, "invalid_request", "scope must be openid");
    }

    let user = gafaelfawr_core::UserMetadata {
        name: None,
        email: None,
        uid: 0,
        gid: None,
        groups: vec![],
    };

    let code = match state
        .oidc
        .issue_code(&query.client_id, &query.redirect_uri, &ctx.username, &user)
        .await
    {
        Ok(code) => code,
        Err(err) => {
            warn!(error = %err, "failed to issue authorization code");
            return error_redirect(&query.redirect_uri, "server_error", "failed to issue code");
        }
    };

    let mut url = query.redirect_uri.clone();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str("code=");
    url.push_str(&urlencoding::encode(&code.to_code_string()));
    if let Some(state_param) = query.state {
        url.push_str("&state=");
        url.push_str(&urlencoding::encode(&state_param));
    }
    Redirect::to(&url).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    grant_type: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    error_description: String,
}

fn oauth_error(status: StatusCode, error: &'static str, description: impl Into<String>) -> Response {
    (
        status,
        Json(OAuthErrorBody {
            error,
            error_description: description.into(),
        }),
    )
        .into_response()
}

/// `POST /auth/openid/token` — redeem an authorization code for a JWT.
async fn token_handler(State(state): State<Arc<AppState>>, Form(form): Form<TokenForm>) -> Response {
    let Some(grant_type) = form.grant_type else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "missing grant_type");
    };
    if grant_type != "authorization_code" {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            "only authorization_code is supported",
        );
    }

    let Some(client_id) = form.client_id else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "missing client_id");
    };
    let Some(client_secret) = form.client_secret else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client", "missing client_secret");
    };
    let Some(code_str) = form.code else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "missing code");
    };
    let Some(redirect_uri) = form.redirect_uri else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "missing redirect_uri");
    };

    let Some(code) = Token::parse_code(&code_str) else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "malformed authorization code");
    };

    match state
        .oidc
        .redeem_code(&client_id, &client_secret, &redirect_uri, &code)
        .await
    {
        Ok(reply) => {
            let mut response = Json(reply).into_response();
            let headers = response.headers_mut();
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
            response
        }
        Err(err) => oauth_error(StatusCode::BAD_REQUEST, err.oauth_error_code(), err.to_string()),
    }
}

/// `GET /auth/openid/userinfo` — verify the bearer JWT and echo its claims.
async fn userinfo_handler(State(state): State<Arc<AppState>>, req: axum::extract::Request) -> Response {
    let Some(raw) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorPage {
                error: "unauthorized",
                message: "missing bearer token".to_owned(),
            }),
        )
            .into_response();
    };

    match state.oidc.verify_token(raw) {
        Ok(claims) => Json(claims).into_response(),
        Err(err) => (
            StatusCode::FORBIDDEN,
            Json(ErrorPage {
                error: "forbidden",
                message: err.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn jwks_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.oidc.jwks())
}

async fn openid_configuration_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.oidc.openid_configuration(&state.base_url))
}
