// src/health/checker.rs
use crate::metrics::MetricsCollector;
use crate::proxy::ServerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Background driver that runs `ServerPool::health_check` on a fixed
/// interval. Passes never overlap: a slow pass pushes the next tick back.
pub struct HealthChecker {
    interval: Duration,
    pool: Arc<ServerPool>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(
        interval: Duration,
        pool: Arc<ServerPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            interval,
            pool,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!("Starting health checker with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One full pass over the pool.
    pub async fn run_once(&self) {
        let results = self.pool.health_check().await;

        let healthy_count = results.iter().filter(|(_, r)| r.alive).count();
        let unhealthy_count = results.len() - healthy_count;

        if let Some(metrics) = &self.metrics {
            for (backend, result) in &results {
                metrics.update_backend_health(&backend.id, result.alive, result.latency);
            }
            metrics.update_backend_counts(healthy_count, results.len());
        }

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy_count, unhealthy_count
        );
    }
}
