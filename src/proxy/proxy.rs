// ────────────────────────────────
// src/proxy/proxy.rs
// Proxy component that handles HTTP request forwarding
// ────────────────────────────────

use super::forwarder::{BufferedRequest, RequestForwarder};
use super::pool::ServerPool;
use super::transport::{HyperTransport, Transport};
use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::retry::RetryPolicy;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

pub struct Proxy {
    pool: Arc<ServerPool>,
    forwarder: RequestForwarder,
    metrics: Option<Arc<MetricsCollector>>,
    max_body_bytes: usize,
}

impl Proxy {
    pub fn new(
        config: &Config,
        pool: Arc<ServerPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let transport = Arc::new(HyperTransport::new(config.proxy.timeout()));
        Self::with_transport(pool, transport, RetryPolicy::new(&config.retry), metrics)
            .with_max_body_bytes(config.proxy.max_body_bytes)
    }

    pub fn with_transport(
        pool: Arc<ServerPool>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let forwarder = RequestForwarder::new(pool.clone(), transport, policy, metrics.clone());
        Self {
            pool,
            forwarder,
            metrics,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    /// Forward one inbound request. Every failure is already mapped to the
    /// response the caller should see.
    pub async fn handle(&self, mut req: Request<Body>, client_addr: Option<SocketAddr>) -> Response<Body> {
        let request_id = ensure_request_id(&mut req);
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut req, addr);
        }

        let span = tracing::info_span!(
            "request",
            id = %request_id,
            method = %req.method(),
            path = %req.uri().path()
        );

        let response = async {
            match self.proxy(req).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(%err, "request failed");
                    err.into()
                }
            }
        }
        .instrument(span)
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_request(response.status().as_u16());
        }
        response
    }

    async fn proxy(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let buffered = BufferedRequest::from_request(req, self.max_body_bytes)
            .await
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        self.forwarder.forward(&buffered).await
    }
}

fn ensure_request_id(req: &mut Request<Body>) -> String {
    if let Some(id) = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return id.to_string();
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    id
}

fn append_forwarded_for(req: &mut Request<Body>, addr: SocketAddr) {
    let client = addr.ip().to_string();
    let value = match req
        .headers()
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, client),
        None => client,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        req.headers_mut()
            .insert(HeaderName::from_static(FORWARDED_FOR_HEADER), value);
    }
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Gave up after {0} backend attempts")]
    AttemptsExhausted(u32),

    #[error("Rate limit exceeded for backend {0}")]
    RateLimited(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyBackends | ProxyError::AttemptsExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let message = match err {
            ProxyError::NoHealthyBackends | ProxyError::AttemptsExhausted(_) => {
                "Service not available"
            }
            ProxyError::RateLimited(_) => "Too many requests",
            ProxyError::InvalidRequest(_) => "Bad request",
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = err.status();
        response
    }
}
