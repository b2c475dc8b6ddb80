//! HTTP route modules for the Gafaelfawr API.

pub mod admin;
pub mod health;
pub mod history;
pub mod oidc;
pub mod tokens;

/// Best-effort client address for audit logging: the first hop of
/// `X-Forwarded-For`, or `"unknown"` if absent.
pub(crate) fn client_ip(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_owned()
}
