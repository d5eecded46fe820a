// src/main.rs
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use latency_balancer::{
    config,
    health::{create_probe, HealthChecker},
    metrics::MetricsRegistry,
    proxy::{Proxy, ServerPool},
    server::{metrics::start_metrics_server, RequestHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("latency_balancer=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load(&config_path).await?;

    // Initialize metrics
    let metrics = if config.metrics.enabled {
        let registry = Arc::new(MetricsRegistry::new()?);
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        let collector = registry.collector();
        start_metrics_server(metrics_addr, registry, config.metrics.path.clone()).await?;
        Some(collector)
    } else {
        None
    };

    // Build the backend pool
    let probe = create_probe(&config.health_check)?;
    info!(
        "Health probe: {} every {:?} (timeout {:?})",
        probe.name(),
        config.health_check.interval(),
        config.health_check.timeout()
    );
    let pool = Arc::new(ServerPool::from_config(&config, probe));

    // Start health checker
    let checker = Arc::new(HealthChecker::new(
        config.health_check.interval(),
        pool.clone(),
        metrics.clone(),
    ));
    let checker_task = tokio::spawn(checker.clone().start());

    // Create proxy and request handler
    let proxy = Arc::new(Proxy::new(&config, pool, metrics));
    let handler = RequestHandler::new(proxy).with_status_path(&config.server.status_path);

    info!("Starting load balancer on {}", config.server.listen);

    ServerBuilder::new(config.server.listen)
        .with_handler(handler)
        .serve(shutdown_signal())
        .await?;

    checker.shutdown();
    if let Err(e) = checker_task.await {
        warn!("Health checker task failed: {}", e);
    }

    info!("Load balancer stopped");
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
