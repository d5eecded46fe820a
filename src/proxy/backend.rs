// src/proxy/backend.rs
use super::rate_limit::{RateLimit, TokenBucket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct LiveState {
    alive: bool,
    /// Zero means unknown.
    latency: Duration,
    last_checked: Option<DateTime<Utc>>,
}

/// One upstream server. The URL is its identity and never changes; the
/// alive/latency pair sits behind a single reader/writer lock so readers
/// never see one without the other.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,

    state: RwLock<LiveState>,
    limiter: Option<TokenBucket>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl Backend {
    pub fn new(url: Url, alive: bool, rate_limit: Option<RateLimit>) -> Self {
        let id = backend_id(&url);

        Self {
            id,
            url,
            state: RwLock::new(LiveState {
                alive,
                latency: Duration::ZERO,
                last_checked: None,
            }),
            limiter: rate_limit.map(TokenBucket::new),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LiveState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LiveState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_alive(&self) -> bool {
        self.read().alive
    }

    /// Marking a backend dead also forgets its latency so a stale value
    /// can never win a comparison.
    pub fn set_alive(&self, alive: bool) {
        let mut state = self.write();
        state.alive = alive;
        if !alive {
            state.latency = Duration::ZERO;
        }
    }

    pub fn latency(&self) -> Duration {
        self.read().latency
    }

    pub fn set_latency(&self, latency: Duration) {
        self.write().latency = latency;
    }

    /// Apply a probe result in one write so alive and latency change together.
    pub fn record_probe(&self, alive: bool, latency: Duration) {
        let mut state = self.write();
        state.alive = alive;
        state.latency = if alive { latency } else { Duration::ZERO };
        state.last_checked = Some(Utc::now());
    }

    /// Alive flag and latency read under one lock acquisition.
    pub fn status(&self) -> (bool, Duration) {
        let state = self.read();
        (state.alive, state.latency)
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.read().last_checked
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.is_alive() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Takes one admission token. Always true when no limiter is configured.
    pub fn allow_request(&self) -> bool {
        self.limiter
            .as_ref()
            .map_or(true, |limiter| limiter.try_acquire())
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.limiter.as_ref().map(TokenBucket::limit)
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_metrics(&self) -> BackendMetrics {
        BackendMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// `host:port`, followed by the base path when the URL has one, so two
/// backends on one host under different prefixes stay distinct.
pub fn backend_id(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    let port = url.port_or_known_default().unwrap_or(80);
    match url.path().trim_end_matches('/') {
        "" => format!("{}:{}", host, port),
        path => format!("{}:{}{}", host, port, path),
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackendMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn backend(alive: bool) -> Backend {
        Backend::new(Url::parse("http://127.0.0.1:8001").unwrap(), alive, None)
    }

    #[test]
    fn test_id_uses_host_and_port() {
        let b = Backend::new(Url::parse("https://example.com").unwrap(), true, None);
        assert_eq!(b.id, "example.com:443");
        assert_eq!(backend(true).id, "127.0.0.1:8001");
    }

    #[test]
    fn test_id_keeps_base_path() {
        let v1 = Backend::new(Url::parse("http://h/v1").unwrap(), true, None);
        let v2 = Backend::new(Url::parse("http://h/v2/").unwrap(), true, None);
        assert_eq!(v1.id, "h:80/v1");
        assert_eq!(v2.id, "h:80/v2");
        assert_eq!(backend_id(&Url::parse("http://h/").unwrap()), "h:80");
    }

    #[test]
    fn test_set_alive_false_resets_latency() {
        let b = backend(true);
        b.set_latency(Duration::from_millis(40));
        assert_eq!(b.latency(), Duration::from_millis(40));

        b.set_alive(false);
        assert!(!b.is_alive());
        assert_eq!(b.latency(), Duration::ZERO);
    }

    #[test]
    fn test_record_probe_transitions() {
        let b = backend(false);
        b.record_probe(true, Duration::from_millis(12));
        assert_eq!(b.status(), (true, Duration::from_millis(12)));
        assert!(b.last_checked().is_some());

        b.record_probe(false, Duration::from_millis(99));
        assert_eq!(b.status(), (false, Duration::ZERO));
        assert_eq!(b.health_status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_unlimited_backend_always_admits() {
        let b = backend(true);
        assert!(b.rate_limit().is_none());
        assert!((0..1000).all(|_| b.allow_request()));
    }

    #[test]
    fn test_limited_backend_rejects_over_burst() {
        let b = Backend::new(
            Url::parse("http://127.0.0.1:8001").unwrap(),
            true,
            RateLimit::new(1, Some(1)),
        );
        assert!(b.allow_request());
        assert!(!b.allow_request());
    }

    #[test]
    fn test_request_counters() {
        let b = backend(true);
        b.record_request(true);
        b.record_request(false);
        let metrics = b.get_metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[test]
    fn test_concurrent_readers_never_see_dead_with_latency() {
        let b = Arc::new(backend(true));
        let writer = {
            let b = b.clone();
            std::thread::spawn(move || {
                for i in 0..2000u64 {
                    b.record_probe(i % 2 == 0, Duration::from_millis(1 + i % 7));
                }
            })
        };

        for _ in 0..2000 {
            let (alive, latency) = b.status();
            if !alive {
                assert_eq!(latency, Duration::ZERO);
            }
        }
        writer.join().unwrap();
    }
}
