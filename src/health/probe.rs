// src/health/probe.rs
use crate::config::{HealthCheckConfig, ProbeStrategy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

/// Outcome of a single liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub alive: bool,
    /// Wall-clock time of a successful probe; zero when the probe failed.
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeResult {
    fn up(started: Instant) -> Self {
        Self {
            alive: true,
            // Zero latency means "unknown", so a success is never reported as zero.
            latency: started.elapsed().max(Duration::from_nanos(1)),
            error: None,
        }
    }

    fn down(error: impl Into<String>) -> Self {
        Self {
            alive: false,
            latency: Duration::ZERO,
            error: Some(error.into()),
        }
    }
}

/// A liveness/latency check against one backend. Implementations must
/// report failures through `ProbeResult` and never panic.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &Url) -> ProbeResult;

    fn name(&self) -> &'static str;
}

/// Issues `GET <base><path>` and expects exactly `200 OK`.
pub struct HttpProbe {
    client: Client,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, probe_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(probe_timeout)
            .build()
            .context("Failed to create health check HTTP client")?;

        Ok(Self {
            client,
            path: path.into(),
            timeout: probe_timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &Url) -> ProbeResult {
        let url = match target.join(&self.path) {
            Ok(url) => url,
            Err(e) => return ProbeResult::down(format!("invalid health URL: {}", e)),
        };

        let started = Instant::now();
        match timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => ProbeResult::up(started),
            Ok(Ok(response)) => ProbeResult::down(format!("HTTP {}", response.status())),
            Ok(Err(e)) => ProbeResult::down(e.to_string()),
            Err(_) => ProbeResult::down("health check timed out"),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Opens a TCP connection to the backend's host:port and closes it at once.
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            timeout: probe_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, target: &Url) -> ProbeResult {
        let Some(host) = target.host_str() else {
            return ProbeResult::down("backend URL has no host");
        };
        let Some(port) = target.port_or_known_default() else {
            return ProbeResult::down("backend URL has no port");
        };
        // IPv6 literals come back bracketed from `host_str`.
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                ProbeResult::up(started)
            }
            Ok(Err(e)) => ProbeResult::down(e.to_string()),
            Err(_) => ProbeResult::down("connect timed out"),
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Build the probe selected by configuration.
pub fn create_probe(config: &HealthCheckConfig) -> Result<Arc<dyn HealthProbe>> {
    Ok(match config.strategy {
        ProbeStrategy::Http => Arc::new(HttpProbe::new(config.path.clone(), config.timeout())?),
        ProbeStrategy::Tcp => Arc::new(TcpProbe::new(config.timeout())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn probe() -> HttpProbe {
        HttpProbe::new("/health", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_http_probe_success_measures_latency() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        let target = Url::parse(&server.url()).unwrap();
        let result = probe().probe(&target).await;

        mock.assert_async().await;
        assert!(result.alive);
        assert!(result.latency > Duration::ZERO);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_http_probe_requires_exact_200() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(204)
            .create_async()
            .await;

        let target = Url::parse(&server.url()).unwrap();
        let result = probe().probe(&target).await;

        assert!(!result.alive);
        assert_eq!(result.latency, Duration::ZERO);
        assert!(result.error.unwrap().contains("204"));
    }

    #[tokio::test]
    async fn test_http_probe_server_error_is_down() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let target = Url::parse(&server.url()).unwrap();
        assert!(!probe().probe(&target).await.alive);
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = Url::parse(&format!("http://{}", addr)).unwrap();
        let result = probe().probe(&target).await;
        assert!(!result.alive);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_accepting_port_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let target = Url::parse(&format!("http://{}", addr)).unwrap();
        let result = TcpProbe::new(Duration::from_secs(2)).probe(&target).await;
        assert!(result.alive);
        assert!(result.latency > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = Url::parse(&format!("http://{}", addr)).unwrap();
        let result = TcpProbe::new(Duration::from_secs(2)).probe(&target).await;
        assert!(!result.alive);
        assert_eq!(result.latency, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_tcp_probe_without_host_degrades() {
        let target = Url::parse("unix:/tmp/socket").unwrap();
        let result = TcpProbe::new(Duration::from_secs(1)).probe(&target).await;
        assert!(!result.alive);
    }

    #[test]
    fn test_create_probe_follows_strategy() {
        let mut config = HealthCheckConfig::default();
        assert_eq!(create_probe(&config).unwrap().name(), "http");
        config.strategy = ProbeStrategy::Tcp;
        assert_eq!(create_probe(&config).unwrap().name(), "tcp");
    }
}
