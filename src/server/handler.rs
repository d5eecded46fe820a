// src/server/handler.rs
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::proxy::Proxy;

/// Per-connection service: serves the pool status page and proxies
/// everything else.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
    status_path: Option<Arc<str>>,
    client_addr: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self {
            proxy,
            status_path: None,
            client_addr: None,
        }
    }

    /// Serve the JSON pool snapshot at `path`. An empty path disables it.
    pub fn with_status_path(mut self, path: &str) -> Self {
        self.status_path = (!path.is_empty()).then(|| Arc::from(path));
        self
    }

    /// Copy of this handler bound to one accepted connection.
    pub fn for_connection(&self, client_addr: SocketAddr) -> Self {
        Self {
            client_addr: Some(client_addr),
            ..self.clone()
        }
    }

    fn is_status_request(&self, req: &Request<Body>) -> bool {
        req.method() == Method::GET
            && self
                .status_path
                .as_deref()
                .map_or(false, |path| req.uri().path() == path)
    }
}

fn status_response(proxy: &Proxy) -> Response<Body> {
    let (status, body) = match serde_json::to_vec(&proxy.pool().snapshot()) {
        Ok(body) => (StatusCode::OK, Body::from(body)),
        Err(e) => {
            tracing::error!(%e, "failed to encode pool status");
            (StatusCode::INTERNAL_SERVER_ERROR, Body::from("Internal error"))
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.proxy.clone();
        let client_addr = self.client_addr;

        if self.is_status_request(&req) {
            return Box::pin(async move { Ok(status_response(&proxy)) });
        }

        Box::pin(async move { Ok(proxy.handle(req, client_addr).await) })
    }
}
