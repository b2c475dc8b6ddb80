//! Server bootstrap and run loop.
//!
//! Wires the storage backend, the token service, and the OIDC provider into
//! a running Axum server, then serves it with graceful shutdown. Three
//! background workers — expiration sweep, history truncation, and audit
//! reconciliation — run alongside the server and are cancelled on shutdown.
//! Shared between the `gafaelfawr-server` binary and the CLI's `run`
//! subcommand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::Router;
use chrono::Duration as ChronoDuration;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gafaelfawr_core::{
    KvTokenStore, MemoryHistoryStore, MemoryRelationalStore, OidcConfig, OidcProvider,
    PostgresHistoryStore, PostgresRelationalStore, TokenCache, TokenService, TokenServiceConfig,
};
use gafaelfawr_storage::{MemoryBackend, PostgresBackend, StorageBackend};

use crate::config::{ServerConfig, Settings, StorageBackendType};
use crate::routes;
use crate::state::AppState;

/// Bootstrap state from `config`, then serve until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!(storage = ?config.storage_backend, "gafaelfawr starting");

    let settings = Settings::load(std::path::Path::new(&config.settings_path))
        .with_context(|| format!("failed to load settings from {}", config.settings_path))?;

    let state = build_app_state(&config, &settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let expire_worker = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.expire_scan_interval_secs;
        tokio::spawn(async move {
            sweep_worker("expiration sweep", interval_secs, &mut rx, move || {
                let state = Arc::clone(&state);
                async move { state.token_service.expire_tokens().await.map_err(|e| e.to_string()) }
            })
            .await;
        })
    };

    let truncate_worker = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.truncate_scan_interval_secs;
        tokio::spawn(async move {
            sweep_worker("history truncation", interval_secs, &mut rx, move || {
                let state = Arc::clone(&state);
                async move { state.token_service.truncate_history().await.map_err(|e| e.to_string()) }
            })
            .await;
        })
    };

    let audit_worker = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.audit_scan_interval_secs;
        tokio::spawn(async move {
            sweep_worker("audit reconciliation", interval_secs, &mut rx, move || {
                let state = Arc::clone(&state);
                async move {
                    let alerts = state.token_service.audit(true).await.map_err(|e| e.to_string())?;
                    Ok(alerts.len() as u64)
                }
            })
            .await;
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "gafaelfawr server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = tokio::join!(expire_worker, truncate_worker, audit_worker);
    })
    .await;

    info!("gafaelfawr server stopped");
    Ok(())
}

async fn build_app_state(config: &ServerConfig, settings: &Settings) -> anyhow::Result<Arc<AppState>> {
    let (kv_backend, database_url): (Arc<dyn StorageBackend>, Option<String>) = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            (Arc::new(MemoryBackend::new()), None)
        }
        StorageBackendType::Postgres { url } => {
            info!("using PostgreSQL storage");
            let backend = PostgresBackend::connect(url)
                .await
                .context("failed to connect to PostgreSQL KV backend")?;
            (Arc::new(backend), Some(url.clone()))
        }
    };

    let kv = KvTokenStore::new(Arc::clone(&kv_backend));

    let relational: Box<dyn gafaelfawr_core::RelationalTokenStore> = match &database_url {
        Some(url) => Box::new(
            PostgresRelationalStore::connect(url)
                .await
                .context("failed to connect relational store")?,
        ),
        None => Box::new(MemoryRelationalStore::new()),
    };

    let history: Box<dyn gafaelfawr_core::ChangeHistoryStore> = match &database_url {
        Some(url) => Box::new(
            PostgresHistoryStore::connect(url)
                .await
                .context("failed to connect history store")?,
        ),
        None => Box::new(MemoryHistoryStore::new()),
    };

    let service_config = TokenServiceConfig {
        known_scopes: settings.known_scopes.clone(),
        session_lifetime: settings.session_lifetime(),
        minimum_lifetime: ChronoDuration::minutes(5),
        change_history_retention: settings.change_history_retention(),
        derived_lifetime: settings.derived_lifetime(),
        bot_username_prefix: settings.bot_username_prefix.clone(),
    };

    let token_service = Arc::new(TokenService::new(
        kv,
        relational,
        history,
        TokenCache::default(),
        service_config,
    ));

    let signing_key = match &settings.signing_key_pem {
        Some(pem) => RsaPrivateKey::from_pkcs1_pem(pem).context("failed to parse configured RSA signing key")?,
        None => {
            warn!("no signing_key_pem configured; generating an ephemeral RSA key for this process only");
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).context("failed to generate RSA signing key")?
        }
    };

    let oidc = Arc::new(OidcProvider::new(
        kv_backend,
        signing_key,
        OidcConfig {
            issuer: settings.issuer.clone(),
            id_token_lifetime: settings.id_token_lifetime(),
            clients: settings.oidc_clients.iter().cloned().map(Into::into).collect(),
            key_id: settings.key_id.clone(),
        },
    ));

    Ok(Arc::new(AppState {
        token_service,
        oidc,
        bootstrap_token: settings.bootstrap_token.clone(),
        base_url: settings.base_url(),
    }))
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::tokens::router(Arc::clone(&state)))
        .merge(routes::history::router(Arc::clone(&state)))
        .merge(routes::admin::router(Arc::clone(&state)))
        .merge(routes::oidc::router(Arc::clone(&state)))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .with_state(state)
}

const SWEEP_MAX_RETRIES: u32 = 3;

/// Run a periodic background sweep, retrying transient failures with
/// exponential backoff and escalating log severity after repeated
/// consecutive failures.
async fn sweep_worker<F, Fut>(name: &str, interval_secs: u64, shutdown: &mut watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<u64, String>>,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut consecutive_failures: u32 = 0;
    info!(worker = name, interval_secs, "background worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match retry_tick(&mut tick, shutdown).await {
                    Ok(None) => {
                        info!(worker = name, "background worker shutting down");
                        return;
                    }
                    Ok(Some(affected)) => {
                        consecutive_failures = 0;
                        if affected > 0 {
                            info!(worker = name, affected, "background worker tick complete");
                        }
                    }
                    Err(last_err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            tracing::error!(
                                worker = name,
                                error = %last_err,
                                consecutive_failures,
                                "background worker persistently failing — storage may be down"
                            );
                        } else {
                            warn!(
                                worker = name,
                                error = %last_err,
                                consecutive_failures,
                                "background worker tick failed after retries, will retry next tick"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!(worker = name, "background worker shutting down");
                return;
            }
        }
    }
}

async fn retry_tick<F, Fut>(tick: &mut F, shutdown: &mut watch::Receiver<bool>) -> Result<Option<u64>, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<u64, String>>,
{
    let mut last_err = String::new();

    for attempt in 0..=SWEEP_MAX_RETRIES {
        match tick().await {
            Ok(affected) => return Ok(Some(affected)),
            Err(e) => {
                last_err = e;
                if attempt == SWEEP_MAX_RETRIES {
                    break;
                }
                let backoff = Duration::from_secs(1u64 << attempt);
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        return Ok(None);
                    }
                }
            }
        }
    }

    Err(last_err)
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
