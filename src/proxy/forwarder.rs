// src/proxy/forwarder.rs
use super::pool::ServerPool;
use super::proxy::ProxyError;
use super::transport::Transport;
use crate::metrics::MetricsCollector;
use crate::retry::{RetryAction, RetryPolicy, RetryState};
use hyper::body::{Bytes, HttpBody};
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::{Body, Method, Request, Response, Uri, Version};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// An inbound request with its body read into memory so it can be sent
/// more than once.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),
}

impl BufferedRequest {
    /// Read the body into memory, refusing anything over `max_bytes`.
    pub async fn from_request(
        req: Request<Body>,
        max_bytes: usize,
    ) -> Result<Self, BufferError> {
        let (parts, mut body) = req.into_parts();

        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.map_or(false, |len| len > max_bytes as u64) {
            return Err(BufferError::TooLarge(max_bytes));
        }

        // Content-Length can be absent or wrong, so count as we read.
        let mut buf = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > max_bytes {
                return Err(BufferError::TooLarge(max_bytes));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Bytes::from(buf),
        })
    }

    pub fn to_request(&self) -> Request<Body> {
        let mut req = Request::new(Body::from(self.body.clone()));
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        req
    }
}

/// Drives one inbound request through peer selection, admission, and the
/// bounded retry/failover loop.
pub struct RequestForwarder {
    pool: Arc<ServerPool>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RequestForwarder {
    pub fn new(
        pool: Arc<ServerPool>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            pool,
            transport,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn forward(&self, req: &BufferedRequest) -> Result<Response<Body>, ProxyError> {
        let mut state = RetryState::default();

        'select: loop {
            if state.exhausted(&self.policy) {
                warn!(
                    path = %req.uri.path(),
                    attempts = state.attempts,
                    "Max attempts reached, terminating"
                );
                return Err(ProxyError::AttemptsExhausted(state.attempts));
            }

            let backend = self.pool.next_peer().ok_or(ProxyError::NoHealthyBackends)?;

            if !backend.allow_request() {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rate_limited(&backend.id);
                }
                return Err(ProxyError::RateLimited(backend.id.clone()));
            }

            loop {
                let started = Instant::now();
                let result = self.transport.forward(&backend.url, req.to_request()).await;
                let success = result.is_ok();

                backend.record_request(success);
                if let Some(metrics) = &self.metrics {
                    metrics.record_backend_request(&backend.id, success, started.elapsed());
                }

                let error = match result {
                    Ok(response) => {
                        debug!(
                            backend = %backend.id,
                            status = %response.status(),
                            attempt = state.attempts,
                            retry = state.retries,
                            "Forwarded request"
                        );
                        return Ok(response);
                    }
                    Err(e) => e,
                };

                warn!(backend = %backend.id, error = %error, "Transport failure");

                let (next, action) = state.on_transport_failure(&self.policy);
                state = next;

                match action {
                    RetryAction::RetrySame { backoff } => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_retry(&backend.id);
                        }
                        sleep(backoff).await;
                    }
                    RetryAction::Failover => {
                        self.pool.mark_backend_status(&backend.url, false);
                        if let Some(metrics) = &self.metrics {
                            metrics.record_marked_dead();
                        }
                        info!(
                            backend = %backend.id,
                            attempt = state.attempts,
                            "Retries exhausted, selecting another backend"
                        );
                        continue 'select;
                    }
                }
            }
        }
    }
}
