// src/config/models.rs
use crate::proxy::backend_id;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Path of the JSON status endpoint. Empty disables it.
    #[serde(default = "default_status_path")]
    pub status_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            status_path: default_status_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: Url,
    /// Requests per second for this backend; 0 or absent inherits the pool default.
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl BackendConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            rate_limit_per_sec: None,
            burst: None,
        }
    }
}

/// Pool-wide default admission limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub default_per_sec: u32,
    #[serde(default)]
    pub default_burst: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    Http,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_probe_strategy")]
    pub strategy: ProbeStrategy,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether backends start out alive before the first probe completes.
    #[serde(default = "default_true")]
    pub initial_alive: bool,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            strategy: default_probe_strategy(),
            path: default_health_path(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
            initial_alive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_attempts: default_max_attempts(),
            backoff: default_backoff_kind(),
            backoff_ms: default_backoff_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_timeout_secs")]
    pub timeout_secs: u64,
    /// Largest request body buffered for replay; bigger bodies get a 400.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxy_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("at least one backend must be configured");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend_id(&backend.url)) {
                bail!("backend {} is configured more than once", backend.url);
            }
            match backend.url.scheme() {
                "http" | "https" => {}
                other => bail!("backend {} has unsupported scheme '{}'", backend.url, other),
            }
            if backend.url.host_str().is_none() {
                bail!("backend {} has no host", backend.url);
            }
        }

        if self.health_check.interval_secs == 0 {
            bail!("health_check.interval_secs must be greater than zero");
        }
        if self.health_check.timeout_secs == 0 {
            bail!("health_check.timeout_secs must be greater than zero");
        }
        if self.proxy.timeout_secs == 0 {
            bail!("proxy.timeout_secs must be greater than zero");
        }
        if self.proxy.max_body_bytes == 0 {
            bail!("proxy.max_body_bytes must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            bail!("metrics.path must start with '/'");
        }

        Ok(())
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_status_path() -> String {
    "/lb/status".to_string()
}

fn default_probe_strategy() -> ProbeStrategy {
    ProbeStrategy::Http
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_interval_secs() -> u64 {
    20
}

fn default_health_timeout_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Fixed
}

fn default_backoff_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    1000
}

fn default_proxy_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    crate::proxy::DEFAULT_MAX_BODY_BYTES
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
