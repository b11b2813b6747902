use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lessond::config::Config;
use lessond::engine::EngineSettings;
use lessond::http::{self, AppState};
use lessond::schedule::{CalendarFeed, MemoryCalendarFeed};
use lessond::tenant::{TenantConfig, TenantManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    lessond::observability::init(config.metrics_port)?;

    let tenants = Arc::new(TenantManager::new(TenantConfig {
        data_dir: config.data_dir.clone(),
        compact_threshold: config.compact_threshold,
        settings: EngineSettings {
            timezone: config.timezone,
        },
        sweep_every: config.sweep_every,
    }));
    let loaded = tenants.load_existing()?;

    let feed: Arc<dyn CalendarFeed> = match &config.events_file {
        Some(path) => Arc::new(MemoryCalendarFeed::from_file(path)?),
        None => Arc::new(MemoryCalendarFeed::new()),
    };
    if config.cron_secret.is_none() {
        tracing::warn!("LESSOND_CRON_SECRET not set, expiry sweep endpoint is locked");
    }

    let state = AppState {
        tenants,
        feed,
        cron_secret: config.cron_secret.as_deref().map(Arc::from),
    };
    let app = http::router(state, config.max_connections);

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("lessond listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  studios loaded: {loaded}");
    info!("  timezone: {}", config.timezone);
    info!("  max_in_flight: {}", config.max_connections);
    info!(
        "  sweep: {}",
        config
            .sweep_every
            .map_or("external".to_string(), |every| format!("every {}s", every.as_secs()))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("lessond stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM; in-flight requests then drain.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
