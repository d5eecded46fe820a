//! src/bin/test_backend.rs
//! Run: cargo run --bin test-backend -- <port> [name]
//!
//! Env: BASE_DELAY_MS, JITTER_MS, FAIL_PCT, HEALTH_FLIP_SECS (0 disables).

use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use rand::Rng;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::info;

#[derive(Clone)]
struct BackendState {
    port: u16,
    name: String,
    req_counter: Arc<AtomicU64>,
    healthy_flag: Arc<AtomicBool>,
    base_delay: u64,
    jitter_ms: u64,
    fail_pct: f64,
}

/// Fixed responses served ahead of the default handler.
fn static_response(path: &str) -> Option<(StatusCode, &'static str)> {
    match path {
        "/static1" => Some((StatusCode::OK, "This is static response 1.")),
        "/static2" => Some((StatusCode::NOT_FOUND, "Static resource not found.")),
        _ => None,
    }
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn handle(req: Request<Body>, state: BackendState) -> Result<Response<Body>, Infallible> {
    let n = state.req_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let path = req.uri().path().to_owned();

    // /health is always fast
    if path == "/health" {
        return Ok(if state.healthy_flag.load(Ordering::SeqCst) {
            text(StatusCode::OK, "OK")
        } else {
            text(StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
        });
    }

    if let Some((status, body)) = static_response(&path) {
        return Ok(text(status, body));
    }

    let delay = state.base_delay + rand::thread_rng().gen_range(0..=state.jitter_ms);
    if delay > 0 {
        sleep(Duration::from_millis(delay)).await;
    }

    if state.fail_pct > 0.0 && rand::thread_rng().gen_bool((state.fail_pct / 100.0).min(1.0)) {
        return Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "Injected failure"));
    }

    let body = serde_json::json!({
        "backend": state.name,
        "port": state.port,
        "req": n,
        "path": path,
        "delay_ms": delay,
    });

    let mut response = text(StatusCode::OK, body.to_string());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    if let Ok(name) = hyper::header::HeaderValue::from_str(&state.name) {
        response.headers_mut().insert("x-backend-name", name);
    }
    Ok(response)
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("test_backend=info".parse()?),
        )
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PORT").ok())
        .unwrap_or_else(|| "8001".into())
        .parse()?;
    let name = std::env::args()
        .nth(2)
        .or_else(|| std::env::var("BACKEND_NAME").ok())
        .unwrap_or_else(|| format!("backend-{port}"));

    let state = BackendState {
        port,
        name: name.clone(),
        req_counter: Arc::new(AtomicU64::new(0)),
        healthy_flag: Arc::new(AtomicBool::new(true)),
        base_delay: env_or("BASE_DELAY_MS", 0),
        jitter_ms: env_or("JITTER_MS", 0),
        fail_pct: env_or("FAIL_PCT", 0.0),
    };

    let flip_secs: u64 = env_or("HEALTH_FLIP_SECS", 0);
    if flip_secs > 0 {
        let st = state.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(flip_secs)).await;
                let was_healthy = st.healthy_flag.fetch_xor(true, Ordering::SeqCst);
                info!(
                    backend = %st.name,
                    "Health flipped to {}",
                    if was_healthy { "unhealthy" } else { "healthy" }
                );
            }
        });
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let make_svc = make_service_fn(move |_conn| {
        let st = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, st.clone()))) }
    });

    info!(
        "Mock backend '{}' on http://{}  [delay={}ms±{} fail={}%]",
        name,
        addr,
        env_or::<u64>("BASE_DELAY_MS", 0),
        env_or::<u64>("JITTER_MS", 0),
        env_or::<f64>("FAIL_PCT", 0.0)
    );

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
