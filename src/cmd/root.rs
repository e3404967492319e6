//! Main daemon command - starts the orchestrator server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cap_orchestrator::auth::AuthResolver;
use cap_orchestrator::config::Configuration;
use cap_orchestrator::dispatcher::{self, AppState};
use cap_orchestrator::health::HealthProber;
use cap_orchestrator::lifecycle::LifecycleController;
use cap_orchestrator::memory::MemoryProbe;
use cap_orchestrator::monitor::MonitorLoop;
use cap_orchestrator::registry::{FileCatalog, Registry};
use cap_orchestrator::runtime::{ContainerRuntime, DockerRuntime};

/// Run the orchestrator daemon.
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;

    info!("  api: {}:{}", config.api.host, config.api.port);
    info!("  docker socket: {}", config.docker.socket);
    info!("  catalog: {}", config.catalog.path.display());

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(&config.docker.socket)
            .map_err(|e| anyhow::anyhow!("failed to connect to the container engine: {}", e))?,
    );

    let catalog = Box::new(FileCatalog::new(config.catalog.path.clone()));
    let registry = Arc::new(Registry::new(catalog, runtime.clone()));

    info!("performing initial registry refresh...");
    registry.refresh().await?;
    info!("registered {} services", registry.iter().len());

    let memory = Arc::new(MemoryProbe::new(Duration::from_secs(
        config.scheduler.memory_cache_ttl_secs,
    )));
    let health = Arc::new(HealthProber::new());
    let lifecycle = Arc::new(LifecycleController::new(
        registry.clone(),
        runtime.clone(),
        health.clone(),
        memory.clone(),
        &config,
    ));
    let auth = Arc::new(AuthResolver::new(config.auth.clone()));

    let state = AppState {
        registry: registry.clone(),
        runtime: runtime.clone(),
        lifecycle: lifecycle.clone(),
        memory: memory.clone(),
        auth,
        http: reqwest::Client::new(),
    };
    let app = dispatcher::router(state);

    let shutdown_token = CancellationToken::new();

    let monitor = MonitorLoop::new(
        registry.clone(),
        runtime.clone(),
        lifecycle.clone(),
        memory.clone(),
        Duration::from_secs(config.scheduler.tick_interval_secs),
    );
    let monitor_token = shutdown_token.clone();
    tokio::spawn(async move {
        monitor.run(monitor_token).await;
    });
    info!(
        "started monitor loop (tick every {}s)",
        config.scheduler.tick_interval_secs
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_token_clone = shutdown_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
        warn!("received shutdown signal, draining in-flight requests...");
        shutdown_token_clone.cancel();
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(30)));
    });

    if config.api.ssl.enabled {
        info!("starting https server on {} (ssl enabled)", bind_addr);
        let tls_config = RustlsConfig::from_pem_file(&config.api.ssl.cert, &config.api.ssl.key)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load tls config: {}", e))?;

        axum_server::bind_rustls(bind_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        info!("starting http server on {} (ssl disabled)", bind_addr);
        axum_server::bind(bind_addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    info!("daemon stopped");
    Ok(())
}

