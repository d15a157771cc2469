use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sitemap_relay::config::{ConfigWatcher, RelayConfig};
use sitemap_relay::scheduler::{InMemoryLastRunStore, Scheduler};
use sitemap_relay::{auth, http, AppState};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sitemap-relay", about = "Reverse proxy and real-time state relay for a home-automation sitemap backend")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `listen.http_addr` from the config file.
    #[arg(long)]
    bind: Option<String>,
}

/// A directory with no accounts; every real deployment wires in a proper
/// backend, but this lets the binary boot without one configured.
struct EmptyDirectory;

#[async_trait::async_trait]
impl auth::UserDirectory for EmptyDirectory {
    async fn lookup(&self, _username: &str) -> Option<auth::UserRecord> {
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        RelayConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        RelayConfig::default()
    };
    if let Some(bind) = &cli.bind {
        config.listen.http_addr = Some(bind.clone());
    }
    config.validate()?;

    let config_watcher = Arc::new(ConfigWatcher::new(cli.config.clone(), config));
    let directory: Arc<dyn auth::UserDirectory> = Arc::new(EmptyDirectory);
    let app_state = AppState::new(config_watcher.clone(), directory);

    app_state.hub.clone().spawn_liveness_task().await;

    let mut scheduler = Scheduler::new(Arc::new(InMemoryLastRunStore::new()));
    scheduler.start(app_state.clone());

    let addr: SocketAddr = config_watcher
        .current()
        .listen
        .http_addr
        .clone()
        .ok_or_else(|| anyhow::anyhow!("listen.http_addr must be set to serve HTTP"))?
        .parse()?;

    let router = http::build_router(app_state);
    tracing::info!(%addr, "sitemap-relay listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    scheduler.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
