// src/metrics/collector.rs
use anyhow::{Context, Result};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("Failed to encode metrics")?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Inbound
    pub requests_total: IntCounterVec,

    // Backend forwarding
    pub backend_requests_total: IntCounterVec,
    pub backend_request_duration_seconds: HistogramVec,
    pub retries_total: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub backends_marked_dead_total: IntCounter,

    // Health
    pub backend_health_status: IntGaugeVec,
    pub backend_latency_seconds: GaugeVec,
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total number of inbound requests"),
            &["status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let backend_requests_total = IntCounterVec::new(
            Opts::new("lb_backend_requests_total", "Total backend forwards"),
            &["backend", "status"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_backend_request_duration_seconds",
                "Backend forward duration",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_request_duration_seconds.clone()))?;

        let retries_total = IntCounterVec::new(
            Opts::new("lb_retries_total", "Retries against the same backend"),
            &["backend"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new("lb_rate_limited_total", "Requests rejected by a backend rate limit"),
            &["backend"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let backends_marked_dead_total = IntCounter::new(
            "lb_backends_marked_dead_total",
            "Backends marked dead after exhausting retries",
        )?;
        registry.register(Box::new(backends_marked_dead_total.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health status (1=healthy, 0=unhealthy)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let backend_latency_seconds = GaugeVec::new(
            Opts::new(
                "lb_backend_latency_seconds",
                "Latency measured by the last successful probe",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_latency_seconds.clone()))?;

        let healthy_backends =
            IntGauge::new("lb_healthy_backends", "Number of healthy backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends =
            IntGauge::new("lb_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            backend_requests_total,
            backend_request_duration_seconds,
            retries_total,
            rate_limited_total,
            backends_marked_dead_total,
            backend_health_status,
            backend_latency_seconds,
            healthy_backends,
            total_backends,
        })
    }

    pub fn record_request(&self, status_code: u16) {
        self.requests_total
            .with_label_values(&[&status_code.to_string()])
            .inc();
    }

    pub fn record_backend_request(&self, backend: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, status])
            .inc();

        self.backend_request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_retry(&self, backend: &str) {
        self.retries_total.with_label_values(&[backend]).inc();
    }

    pub fn record_rate_limited(&self, backend: &str) {
        self.rate_limited_total.with_label_values(&[backend]).inc();
    }

    pub fn record_marked_dead(&self) {
        self.backends_marked_dead_total.inc();
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool, latency: Duration) {
        self.backend_health_status
            .with_label_values(&[backend])
            .set(i64::from(healthy));
        self.backend_latency_seconds
            .with_label_values(&[backend])
            .set(latency.as_secs_f64());
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_recorded_series() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.record_request(503);
        metrics.record_retry("127.0.0.1:8001");
        metrics.record_rate_limited("127.0.0.1:8002");
        metrics.update_backend_health("127.0.0.1:8001", true, Duration::from_millis(5));
        metrics.update_backend_counts(1, 2);

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains("lb_requests_total{status_code=\"503\"} 1"));
        assert!(text.contains("lb_retries_total{backend=\"127.0.0.1:8001\"} 1"));
        assert!(text.contains("lb_rate_limited_total{backend=\"127.0.0.1:8002\"} 1"));
        assert!(text.contains("lb_healthy_backends 1"));
        assert!(text.contains("lb_total_backends 2"));
    }
}
