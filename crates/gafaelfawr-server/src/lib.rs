//! Gafaelfawr HTTP server.
//!
//! Wires the token service, the OIDC provider, and the authorization gate
//! into a running Axum server exposing the token REST API and the OIDC
//! provider endpoints.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
