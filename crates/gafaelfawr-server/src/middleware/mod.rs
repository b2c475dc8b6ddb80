//! Authentication middleware for the Gafaelfawr server.

mod auth_gate;

pub use auth_gate::{auth_gate, AuthContext, AuthGateOptions};
