// src/proxy/mod.rs
mod backend;
mod forwarder;
mod pool;
mod proxy;
mod rate_limit;
mod transport;

pub use backend::{backend_id, Backend, BackendMetrics, HealthStatus};
pub use forwarder::{BufferError, BufferedRequest, RequestForwarder};
pub use pool::{BackendSnapshot, PoolSnapshot, ServerPool};
pub use proxy::{Proxy, ProxyError, DEFAULT_MAX_BODY_BYTES, REQUEST_ID_HEADER};
pub use rate_limit::{RateLimit, TokenBucket};
pub use transport::{rewrite_uri, HyperTransport, Transport, TransportError};
