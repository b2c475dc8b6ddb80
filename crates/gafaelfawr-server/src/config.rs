//! Server configuration for Gafaelfawr.
//!
//! The bulk of configuration — known scopes, token lifetimes, OIDC clients,
//! the signing key — comes from a YAML settings file, matching how a
//! deployment's scopes and clients are too structured for a flat env var.
//! A handful of deployment-specific scalars (bind address, log level,
//! database URL) are still read directly from `GAFAELFAWR_*` environment
//! variables, the way the teacher's `ServerConfig::from_env` layers its
//! overrides.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use chrono::Duration;
use gafaelfawr_core::OidcClient;
use serde::Deserialize;

/// Top-level settings file, loaded from the path named by
/// `GAFAELFAWR_SETTINGS_PATH`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub issuer: String,
    /// Base URL the server is reachable at, used to build discovery and
    /// redirect URLs. Defaults to `issuer` when omitted.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub known_scopes: HashSet<String>,
    #[serde(default = "default_session_lifetime_minutes")]
    pub session_lifetime_minutes: i64,
    #[serde(default = "default_derived_lifetime_minutes")]
    pub derived_lifetime_minutes: i64,
    #[serde(default = "default_id_token_lifetime_minutes")]
    pub id_token_lifetime_minutes: i64,
    #[serde(default = "default_history_retention_days")]
    pub change_history_retention_days: i64,
    #[serde(default = "default_bot_username_prefix")]
    pub bot_username_prefix: String,
    #[serde(default)]
    pub oidc_clients: Vec<OidcClientSettings>,
    #[serde(default)]
    pub bootstrap_token: Option<String>,
    /// PEM-encoded RSA private key used to sign OIDC JWTs. When absent, a
    /// fresh key is generated at startup (local development only — it does
    /// not survive a restart, so previously issued tokens stop verifying).
    #[serde(default)]
    pub signing_key_pem: Option<String>,
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidcClientSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri_prefix: String,
}

impl From<OidcClientSettings> for OidcClient {
    fn from(s: OidcClientSettings) -> Self {
        Self {
            client_id: s.client_id,
            client_secret: s.client_secret,
            redirect_uri_prefix: s.redirect_uri_prefix,
        }
    }
}

fn default_session_lifetime_minutes() -> i64 {
    8 * 60
}

fn default_derived_lifetime_minutes() -> i64 {
    30 * 24 * 60
}

fn default_id_token_lifetime_minutes() -> i64 {
    10
}

fn default_history_retention_days() -> i64 {
    365
}

fn default_bot_username_prefix() -> String {
    "bot-".to_owned()
}

fn default_key_id() -> String {
    "gafaelfawr".to_owned()
}

impl Settings {
    /// Load and parse the YAML settings file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse as the
    /// expected schema.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(loaded.try_deserialize()?)
    }

    #[must_use]
    pub fn session_lifetime(&self) -> Duration {
        Duration::minutes(self.session_lifetime_minutes)
    }

    #[must_use]
    pub fn derived_lifetime(&self) -> Duration {
        Duration::minutes(self.derived_lifetime_minutes)
    }

    #[must_use]
    pub fn id_token_lifetime(&self) -> Duration {
        Duration::minutes(self.id_token_lifetime_minutes)
    }

    #[must_use]
    pub fn change_history_retention(&self) -> Duration {
        Duration::days(self.change_history_retention_days)
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url.clone().unwrap_or_else(|| self.issuer.clone())
    }
}

/// The storage backend selected for the KV token store and relational
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `PostgreSQL`-backed (production default).
    Postgres { url: String },
}

/// Deployment-level server configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend for the KV token store and relational store.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Path to the YAML settings file.
    pub settings_path: String,
    /// Expiration sweep interval in seconds.
    pub expire_scan_interval_secs: u64,
    /// History truncation sweep interval in seconds.
    pub truncate_scan_interval_secs: u64,
    /// Audit reconciliation pass interval in seconds.
    pub audit_scan_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (binds to `0.0.0.0`)
    /// - `GAFAELFAWR_BIND_ADDR` — full bind address (overrides `PORT`,
    ///   default: `127.0.0.1:8080`)
    /// - `GAFAELFAWR_KV_BACKEND` — `memory` or `postgres` (default: `memory`)
    /// - `DATABASE_URL` — PostgreSQL connection string (used for both the KV
    ///   and relational stores when `GAFAELFAWR_KV_BACKEND=postgres`)
    /// - `GAFAELFAWR_LOG_LEVEL` — log filter (default: `info`)
    /// - `GAFAELFAWR_SETTINGS_PATH` — path to the YAML settings file
    ///   (default: `/etc/gafaelfawr/config.yaml`)
    /// - `GAFAELFAWR_EXPIRE_SCAN_INTERVAL` — seconds between expiration
    ///   sweeps (default: `60`)
    /// - `GAFAELFAWR_TRUNCATE_SCAN_INTERVAL` — seconds between history
    ///   truncation sweeps (default: `3600`)
    /// - `GAFAELFAWR_AUDIT_SCAN_INTERVAL` — seconds between audit
    ///   reconciliation passes (default: `300`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("GAFAELFAWR_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8080);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        let storage_backend = match std::env::var("GAFAELFAWR_KV_BACKEND")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => {
                let url = std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/gafaelfawr".to_owned());
                StorageBackendType::Postgres { url }
            }
            _ => StorageBackendType::Memory,
        };

        let log_level = std::env::var("GAFAELFAWR_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let settings_path = std::env::var("GAFAELFAWR_SETTINGS_PATH")
            .unwrap_or_else(|_| "/etc/gafaelfawr/config.yaml".to_owned());

        let expire_scan_interval_secs = std::env::var("GAFAELFAWR_EXPIRE_SCAN_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let truncate_scan_interval_secs = std::env::var("GAFAELFAWR_TRUNCATE_SCAN_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let audit_scan_interval_secs = std::env::var("GAFAELFAWR_AUDIT_SCAN_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Self {
            bind_addr,
            storage_backend,
            log_level,
            settings_path,
            expire_scan_interval_secs,
            truncate_scan_interval_secs,
            audit_scan_interval_secs,
        }
    }
}
