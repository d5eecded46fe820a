// src/proxy/pool.rs
use super::backend::{Backend, BackendMetrics, HealthStatus};
use super::rate_limit::RateLimit;
use crate::config::Config;
use crate::health::{HealthProbe, ProbeResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Ordered, fixed registry of backends. Membership is set up once at
/// startup (`add_backend` takes `&mut self`) and is read-only afterwards,
/// so iteration needs no lock; only the per-backend state and the
/// round-robin cursor are mutated concurrently.
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    current: AtomicUsize,
    default_rate: Option<RateLimit>,
    initial_alive: bool,
    probe: Arc<dyn HealthProbe>,
}

impl ServerPool {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            backends: Vec::new(),
            current: AtomicUsize::new(0),
            default_rate: None,
            initial_alive: true,
            probe,
        }
    }

    /// Limit applied to backends added without an explicit rate.
    pub fn with_default_rate(mut self, default_rate: Option<RateLimit>) -> Self {
        self.default_rate = default_rate;
        self
    }

    /// Whether newly added backends start out alive (optimistic) or dead.
    pub fn with_initial_alive(mut self, alive: bool) -> Self {
        self.initial_alive = alive;
        self
    }

    pub fn from_config(config: &Config, probe: Arc<dyn HealthProbe>) -> Self {
        let default_rate = RateLimit::new(
            config.rate_limit.default_per_sec,
            config.rate_limit.default_burst,
        );

        let mut pool = Self::new(probe)
            .with_default_rate(default_rate)
            .with_initial_alive(config.health_check.initial_alive);

        for backend in &config.backends {
            let rate = backend
                .rate_limit_per_sec
                .and_then(|rps| RateLimit::new(rps, backend.burst));
            pool.add_backend(backend.url.clone(), rate);
        }

        pool
    }

    pub fn add_backend(&mut self, url: Url, rate_limit: Option<RateLimit>) -> Arc<Backend> {
        let rate = RateLimit::resolve(rate_limit, self.default_rate);
        let backend = Arc::new(Backend::new(url, self.initial_alive, rate));

        tracing::info!(
            backend = %backend.id,
            url = %backend.url,
            rate_limit = ?rate,
            "Added backend"
        );

        self.backends.push(backend.clone());
        backend
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Pre-increments the shared cursor and maps it onto the pool.
    ///
    /// # Panics
    ///
    /// Panics on an empty pool, which startup validation rules out.
    pub fn next_index(&self) -> usize {
        self.current.fetch_add(1, Ordering::SeqCst).wrapping_add(1) % self.backends.len()
    }

    /// Pick the backend for the next request.
    ///
    /// The alive backend with the lowest known latency wins; ties go to the
    /// first one in registry order. When no alive backend has a measured
    /// latency, fall back to a single round-robin sweep over the pool.
    /// `None` means no peer is available at all.
    pub fn next_peer(&self) -> Option<Arc<Backend>> {
        if self.backends.is_empty() {
            return None;
        }

        let mut selected: Option<&Arc<Backend>> = None;
        let mut lowest = Duration::MAX;

        for backend in &self.backends {
            let (alive, latency) = backend.status();
            if alive && !latency.is_zero() && latency < lowest {
                lowest = latency;
                selected = Some(backend);
            }
        }

        if let Some(backend) = selected {
            return Some(backend.clone());
        }

        self.next_round_robin()
    }

    fn next_round_robin(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.next_index();

        for offset in 0..len {
            let index = (start + offset) % len;
            let backend = &self.backends[index];
            if backend.is_alive() {
                // Continue the next sweep from here instead of the stale start.
                if offset != 0 {
                    self.current.store(index, Ordering::SeqCst);
                }
                return Some(backend.clone());
            }
        }

        None
    }

    /// Set the alive flag of the first backend whose URL matches.
    /// Unknown URLs are ignored.
    pub fn mark_backend_status(&self, url: &Url, alive: bool) {
        if let Some(backend) = self.backends.iter().find(|b| &b.url == url) {
            backend.set_alive(alive);
            tracing::info!(
                backend = %backend.id,
                alive,
                "Backend status changed"
            );
        }
    }

    /// Probe every backend in registry order and apply each result. One
    /// failing backend never stops the rest of the pass.
    pub async fn health_check(&self) -> Vec<(Arc<Backend>, ProbeResult)> {
        let mut results = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            let result = self.probe.probe(&backend.url).await;
            backend.record_probe(result.alive, result.latency);

            if result.alive {
                tracing::info!(
                    backend = %backend.id,
                    latency = ?result.latency,
                    "Backend [up]"
                );
            } else {
                tracing::warn!(
                    backend = %backend.id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Backend [down]"
                );
            }

            results.push((backend.clone(), result));
        }

        results
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let backends: Vec<BackendSnapshot> = self
            .backends
            .iter()
            .map(|backend| {
                let (alive, latency) = backend.status();
                BackendSnapshot {
                    id: backend.id.clone(),
                    url: backend.url.to_string(),
                    status: if alive {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    latency_ms: latency.as_secs_f64() * 1000.0,
                    last_checked: backend.last_checked(),
                    rate_limit_per_sec: backend.rate_limit().map(|r| r.per_second),
                    requests: backend.get_metrics(),
                }
            })
            .collect();

        PoolSnapshot {
            healthy: backends
                .iter()
                .filter(|b| b.status == HealthStatus::Healthy)
                .count(),
            total: backends.len(),
            backends,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PoolSnapshot {
    pub healthy: usize,
    pub total: usize,
    pub backends: Vec<BackendSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub url: String,
    pub status: HealthStatus,
    pub latency_ms: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub rate_limit_per_sec: Option<u32>,
    pub requests: BackendMetrics,
}
