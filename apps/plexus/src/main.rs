use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plexus_core::config::{AuthConfig, ConfigHandle, ConfigSnapshot};
use plexus_core::cooldown::{CooldownConfig, CooldownManager};
use plexus_core::credential::{CredentialPool, OAuthBroker, refresher};
use plexus_core::dispatch::Dispatcher;
use plexus_core::pricing::StaticPricingOracle;
use plexus_core::router::Router;
use plexus_core::upstream::{UpstreamClientConfig, WreqUpstreamClient};
use plexus_core::usage::UsageRecorder;
use plexus_storage::{
    MemoryCooldownStore, MemoryCredentialStore, MemoryUsageStore, RollingStats,
};

mod auth;
mod routes;

/// In-flight requests get this long to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "plexus", about = "Unified LLM API gateway")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "plexus.json")]
    config: PathBuf,
    /// Listen address override.
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct AppConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(flatten)]
    gateway: ConfigSnapshot,
}

fn default_listen() -> String {
    "0.0.0.0:8890".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read(&cli.config)
        .with_context(|| format!("reading config {}", cli.config.display()))?;
    let app_config: AppConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing config {}", cli.config.display()))?;
    let listen = cli.listen.unwrap_or(app_config.listen);
    let snapshot = app_config.gateway;

    // Stores. The persistence backend sits behind narrow traits; the
    // defaults are in-memory.
    let usage_store = Arc::new(MemoryUsageStore::new());
    let cooldown_store = Arc::new(MemoryCooldownStore::new());
    let credential_store = Arc::new(MemoryCredentialStore::new());

    let cooldowns = Arc::new(
        CooldownManager::load(CooldownConfig::default(), cooldown_store).await,
    );
    let broker: Arc<OAuthBroker> = Arc::new(
        OAuthBroker::new(Duration::from_secs(snapshot.timeouts.oauth_refresh_secs))
            .context("building oauth client")?,
    );
    let pool = Arc::new(CredentialPool::new(
        credential_store,
        cooldowns.clone(),
        broker,
    ));
    for provider in &snapshot.providers {
        if let AuthConfig::Oauth {
            provider_kind,
            account_pool,
        } = &provider.auth
        {
            pool.load_accounts(provider_kind, account_pool).await;
        }
    }

    let stats = Arc::new(RollingStats::default());
    let oracle = Arc::new(StaticPricingOracle::default());
    let router = Router::new(cooldowns.clone(), stats.clone(), oracle.clone());
    let upstream = Arc::new(WreqUpstreamClient::new(
        UpstreamClientConfig::from_timeouts(&snapshot.timeouts),
        None,
    ));
    let config = Arc::new(ConfigHandle::new(snapshot));
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        router,
        cooldowns,
        pool.clone(),
        upstream,
        UsageRecorder::new(usage_store, stats),
        oracle,
    ));

    let refresher_handle = refresher::spawn_refresher(pool, refresher::REFRESH_INTERVAL);

    let app = routes::router(routes::AppState {
        dispatcher: dispatcher.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(event = "listening", addr = %listen);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .into_future(),
    );

    tokio::signal::ctrl_c().await.ok();
    info!(event = "shutdown_requested", grace_secs = SHUTDOWN_GRACE.as_secs());
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(joined) => {
            if let Ok(Err(err)) = joined {
                warn!(event = "server_error", error = %err);
            }
        }
        Err(_) => warn!(event = "shutdown_grace_exceeded"),
    }
    refresher_handle.shutdown().await;
    Ok(())
}
