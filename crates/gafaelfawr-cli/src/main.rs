//! `gafaelfawr` CLI — schema bootstrap, signing-key and bootstrap-token
//! generation, and the server entry point.
//!
//! `run` starts the same server as the `gafaelfawr-server` binary. The
//! other subcommands are one-shot operator utilities used when standing up
//! or rotating a deployment; `update-service-tokens` and
//! `kubernetes-controller` are stubs for peer systems this crate does not
//! implement.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::info;

use gafaelfawr_core::Token;
use gafaelfawr_server::config::{ServerConfig, StorageBackendType};

/// Gafaelfawr — token issuance and authorization gateway.
#[derive(Parser)]
#[command(name = "gafaelfawr", version, about = "Gafaelfawr authentication gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the configured storage backend is reachable.
    ///
    /// Schema creation happens lazily on first connection, so this is a
    /// readiness check rather than a migration step.
    Init,
    /// Generate a new RSA signing keypair and print the private key PEM to
    /// stdout.
    GenerateKey,
    /// Generate a new bootstrap token and print its bearer wire form to
    /// stdout.
    GenerateToken,
    /// Push service tokens to their configured Kubernetes secrets.
    #[command(name = "update-service-tokens")]
    UpdateServiceTokens,
    /// Run the Kubernetes operator that provisions service-token secrets.
    #[command(name = "kubernetes-controller")]
    KubernetesController,
    /// Start the HTTP server.
    Run,
}

fn init_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => cmd_init().await,
        Commands::GenerateKey => cmd_generate_key(),
        Commands::GenerateToken => cmd_generate_token(),
        Commands::UpdateServiceTokens => cmd_update_service_tokens(),
        Commands::KubernetesController => cmd_kubernetes_controller(),
        Commands::Run => cmd_run().await,
    }
}

async fn cmd_init() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_logging(&config.log_level);

    match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("in-memory backend selected, nothing to initialize");
        }
        StorageBackendType::Postgres { url } => {
            let backend = gafaelfawr_storage::PostgresBackend::connect(url)
                .await
                .context("failed to connect to PostgreSQL; schema will not be created")?;
            drop(backend);
            info!("connected to PostgreSQL backend; schema is created lazily on first use");
        }
    }
    println!("gafaelfawr storage is ready");
    Ok(())
}

fn cmd_generate_key() -> anyhow::Result<()> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).context("failed to generate RSA key")?;
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .context("failed to encode RSA key as PEM")?;
    print!("{}", pem.as_str());
    Ok(())
}

fn cmd_generate_token() -> anyhow::Result<()> {
    let token = Token::new();
    println!("{}", token.to_bearer_string());
    Ok(())
}

fn cmd_update_service_tokens() -> anyhow::Result<()> {
    info!("update-service-tokens is a peer concern of this deployment; nothing to do here");
    Ok(())
}

fn cmd_kubernetes_controller() -> anyhow::Result<()> {
    info!("the Kubernetes service-token controller is a peer concern of this deployment; nothing to do here");
    Ok(())
}

async fn cmd_run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_logging(&config.log_level);
    gafaelfawr_server::server::run(config).await
}
