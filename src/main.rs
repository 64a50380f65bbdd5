mod config;
mod health;
mod http;
mod metrics;
mod mirror;
mod routing;
mod vcs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, MappingConfig};
use crate::metrics::MetricsRegistry;
use crate::mirror::{MaxAgePolicy, MirrorStore, SyncEngine};
use crate::routing::RouteTable;
use crate::vcs::Backends;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "vcsmirror", about = "Mirroring gateway for Git and Mercurial repositories")]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address; overrides the config file.
    #[arg(long)]
    http: Option<String>,

    /// Mirror storage root; overrides the config file.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Mappings of the form `prefix,host,repo-route,vcs,scheme`, appended
    /// after those from the config file.
    #[arg(value_parser = config::parse_mapping_arg)]
    mappings: Vec<MappingConfig>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => Config::default(),
        };
        if let Some(http) = self.http {
            config.listen = http;
        }
        if let Some(storage) = self.storage {
            config.storage.root = storage;
        }
        config.mappings.extend(self.mappings);
        config::validate_config(&config)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub routes: Arc<RouteTable>,
    pub store: Arc<MirrorStore>,
    pub backends: Backends,
    pub metrics: MetricsRegistry,
}

impl AppState {
    /// Compile routes and prepare the storage root.
    async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let routes = RouteTable::new(&config.mappings).context("invalid mapping")?;
        let metrics = MetricsRegistry::new();
        let backends = Backends::from_config(&config.vcs);

        let engine = SyncEngine::new(
            config.storage.root.clone(),
            backends.clone(),
            &config.sync,
            metrics.clone(),
        );
        engine.prepare_storage().await?;

        let store = MirrorStore::new(
            Arc::new(engine),
            Arc::new(MaxAgePolicy::from_config(&config)),
            metrics.clone(),
        );

        Ok(Self {
            config,
            routes: Arc::new(routes),
            store: Arc::new(store),
            backends,
            metrics,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr = state.config.listen_addr()?;
    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- CLI + config ----
    let cli = Cli::parse();
    let config = cli.into_config()?;

    tracing::info!(
        listen = %config.listen,
        storage = %config.storage.root.display(),
        mappings = config.mappings.len(),
        "starting vcsmirror"
    );
    for mapping in &config.mappings {
        tracing::info!(
            prefix = %mapping.prefix,
            host = %mapping.host,
            vcs = %mapping.vcs,
            scheme = %mapping.scheme,
            "mapping"
        );
    }

    // ---- App state ----
    let state = Arc::new(AppState::build(config).await?);

    // ---- Serve until signalled ----
    // Detached sync tasks are abandoned on exit; staging is purged at the
    // next start.
    run_http_server(state).await?;

    tracing::info!("vcsmirror shut down cleanly");
    Ok(())
}
