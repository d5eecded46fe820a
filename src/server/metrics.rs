// src/server/metrics.rs
use crate::metrics::MetricsRegistry;
use crate::server::listener::bind_tcp;
use anyhow::Result;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

fn metrics_response(registry: &MetricsRegistry, path: &str, req: &Request<Body>) -> Response<Body> {
    let (status, content_type, body) = if req.uri().path() != path {
        (StatusCode::NOT_FOUND, "text/plain", Body::from("Not Found"))
    } else {
        match registry.gather() {
            Ok(metrics) => (StatusCode::OK, "text/plain; version=0.0.4", Body::from(metrics)),
            Err(e) => {
                error!("Failed to gather metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "text/plain", Body::from("Internal error"))
            }
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}

/// Bind the Prometheus scrape endpoint and serve it in the background.
pub async fn start_metrics_server(
    addr: SocketAddr,
    registry: Arc<MetricsRegistry>,
    path: String,
) -> Result<()> {
    let listener = bind_tcp(addr).await?;
    let path: Arc<str> = Arc::from(path);

    info!("Metrics server listening on http://{}{}", addr, path);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let registry = registry.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Body>| {
                    let response = metrics_response(&registry, &path, &req);
                    async move { Ok::<_, Infallible>(response) }
                });
                if let Err(e) = Http::new().serve_connection(stream, svc).await {
                    warn!(%peer, "Metrics connection error: {}", e);
                }
            });
        }
    });

    Ok(())
}
