// src/proxy/transport.rs
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Body, Client, Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid target {0}")]
    InvalidTarget(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
}

/// Sends one request to one backend and hands back its response untouched.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn forward(&self, target: &Url, req: Request<Body>) -> Result<Response<Body>, TransportError>;
}

/// Headers that only make sense for a single hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder().build(HttpsConnector::new());
        Self { client, timeout }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn forward(
        &self,
        target: &Url,
        mut req: Request<Body>,
    ) -> Result<Response<Body>, TransportError> {
        *req.uri_mut() = rewrite_uri(target, req.uri())?;
        strip_hop_by_hop(req.headers_mut());
        // Let the client derive Host from the rewritten URI.
        req.headers_mut().remove(HOST);
        // Inbound h2 is re-issued upstream as HTTP/1.1; the client rejects
        // an HTTP_2 request on an HTTP/1 connection.
        *req.version_mut() = Version::HTTP_11;

        let mut response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

/// Point the inbound path and query at the backend's scheme and authority,
/// keeping any base path the backend URL carries.
pub fn rewrite_uri(target: &Url, original: &Uri) -> Result<Uri, TransportError> {
    let host = target
        .host_str()
        .ok_or_else(|| TransportError::InvalidTarget(target.to_string()))?;
    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let base = target.path().trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let path_and_query = format!("{}{}", base, path_and_query);

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|e| TransportError::InvalidTarget(format!("{}: {}", target, e)))
}

fn strip_hop_by_hop(headers: &mut HeaderMap<HeaderValue>) {
    // Headers named in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
