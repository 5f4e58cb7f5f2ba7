//! Ferry upload server binary.

use anyhow::{Context, Result};
use clap::Parser;
use ferry_core::config::AppConfig;
use ferry_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ferry - resumable upload server
#[derive(Parser, Debug)]
#[command(name = "ferryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FERRY_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `FERRY_*`
/// environment variables (`FERRY_SERVER__BIND=...`).
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults and environment", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("FERRY_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Ferry v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    ferry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = ferry_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    // Fail fast on a misconfigured or unreachable chunk store.
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    let metadata = ferry_metadata::from_config(&config.metadata, &config.quota)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let state = AppState::new(config.clone(), storage, metadata);

    state
        .reaper
        .recover_interrupted_runs()
        .await
        .context("failed to recover interrupted reaper runs")?;

    let _reaper_handle = if config.reaper.auto_schedule_enabled {
        tracing::info!(
            interval_secs = config.reaper.interval_secs,
            "Cleanup reaper scheduled"
        );
        Some(state.reaper.clone().spawn())
    } else {
        tracing::info!("Automatic reaper scheduling disabled");
        None
    };

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
