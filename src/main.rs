use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{StorageBackend, StorageConfig, WardenConfig};
use ratewarden::http::{health_router, lift_identity, protect, HttpServer};
use ratewarden::ratelimit::Limiter;
use ratewarden::store::{spawn_sweeper, LocalStore, RedisKv, ResilientStore, SharedStore};
use ratewarden::tier::{Environment, PresetTable, TierResolver, TieredLimiter};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Rate limited HTTP API gateway")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<String>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the preset environment (development, testing, production)
    #[arg(long)]
    environment: Option<Environment>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = WardenConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(environment) = cli.environment {
        config.limits.environment = environment;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        environment = %config.limits.environment,
        trust_identity_headers = config.server.trust_identity_headers,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let store = build_store(&config.storage).await;
    let sweeper = spawn_sweeper(store.clone(), config.storage.sweep_interval());

    let presets = match &config.limits.presets_path {
        Some(path) => PresetTable::from_file(path).context("Failed to load rate limit presets")?,
        None => PresetTable::default(),
    };
    let resolver = Arc::new(TierResolver::new(presets, config.limits.clone()));
    let tiered = Arc::new(TieredLimiter::new(resolver.clone(), store.clone())?);

    let mut auth = Router::new().route("/auth/login", post(login));
    if resolver.presets().route("auth").is_some() {
        let auth_limiter = Limiter::new(resolver.route_config("auth")?, store.clone())?;
        auth = protect(auth, Arc::new(auth_limiter));
    } else {
        warn!("No auth route preset configured, login is only covered by tier limits");
    }

    let api = Router::new().route("/api/items", get(list_items)).merge(auth);
    let app = lift_identity(protect(api, tiered), config.server.trust_identity_headers)
        .merge(health_router(store.clone()));

    let server = HttpServer::new(config.server.listen_addr, app);
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.stop().await;
    info!("Ratewarden stopped");
    Ok(())
}

/// Shared backend with local fallback, or local memory only.
async fn build_store(config: &StorageConfig) -> Arc<ResilientStore> {
    let local = Arc::new(LocalStore::new());

    let url = match (config.backend, &config.redis_url) {
        (StorageBackend::Shared, Some(url)) => url,
        _ => {
            info!("Using local memory for rate limit counters");
            return Arc::new(ResilientStore::local_only(local));
        }
    };

    match RedisKv::connect(url, config.operation_timeout()).await {
        Ok(kv) => {
            info!(prefix = %config.key_prefix, "Connected to shared rate limit backend");
            let shared = SharedStore::new(Arc::new(kv), &config.key_prefix);
            Arc::new(ResilientStore::new(shared, local).with_retry_after(config.retry_primary_after()))
        }
        Err(e) => {
            warn!(error = %e, "Shared rate limit backend unreachable, using local memory");
            Arc::new(ResilientStore::local_only(local))
        }
    }
}

async fn list_items() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "items": [] }))
}

async fn login() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
