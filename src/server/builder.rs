// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::handler::RequestHandler;
use crate::server::listener::bind_tcp;
use anyhow::{Context, Result};
use hyper::server::conn::Http;
use std::future::Future;
use std::net::SocketAddr;

/// Builder so `main.rs` can inject its request handler and shutdown signal.
pub struct ServerBuilder {
    addr: SocketAddr,
    handler: Option<RequestHandler>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handler: None }
    }

    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Accept connections until `shutdown` resolves, one Tokio task per
    /// connection.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;

        let listener = bind_tcp(self.addr).await?;
        tracing::info!("HTTP server listening on {}", self.addr);

        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("HTTP server stopping");
                    return Ok(());
                }
            };

            let svc = handler.for_connection(peer);
            tokio::spawn(async move {
                if let Err(err) = Http::new().serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }
    }
}
