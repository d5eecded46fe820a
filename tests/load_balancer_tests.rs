// tests/load_balancer_tests.rs
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode, Version};
use latency_balancer::health::{HealthChecker, HttpProbe, TcpProbe};
use latency_balancer::proxy::{HyperTransport, Proxy, RateLimit, ServerPool};
use latency_balancer::retry::RetryPolicy;
use latency_balancer::server::RequestHandler;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

/// Spawn a backend answering `name` on every path and `health` on /health.
async fn spawn_backend(name: &'static str, health: StatusCode) -> Url {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
            let mut response = if req.uri().path() == "/health" {
                Response::new(Body::from("health"))
            } else {
                Response::new(Body::from(format!("{} {}", name, req.uri())))
            };
            if req.uri().path() == "/health" {
                *response.status_mut() = health;
            }
            Ok::<_, Infallible>(response)
        }))
    });

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let server = Server::bind(&addr).serve(make_svc);
    let url = Url::parse(&format!("http://{}", server.local_addr())).unwrap();
    tokio::spawn(server);
    url
}

/// A URL nothing is listening on.
async fn dead_url() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{}", addr)).unwrap()
}

fn proxy_for(pool: ServerPool) -> Arc<Proxy> {
    Arc::new(Proxy::with_transport(
        Arc::new(pool),
        Arc::new(HyperTransport::new(Duration::from_secs(2))),
        RetryPolicy::fixed(3, 3, Duration::from_millis(1)),
        None,
    ))
}

fn tcp_pool() -> ServerPool {
    ServerPool::new(Arc::new(TcpProbe::new(Duration::from_secs(1))))
}

async fn get(proxy: &Arc<Proxy>, path: &str) -> (StatusCode, String) {
    let req = Request::get(path).body(Body::empty()).unwrap();
    let response = RequestHandler::new(proxy.clone())
        .with_status_path("/lb/status")
        .oneshot(req)
        .await
        .unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let mut pool = tcp_pool();
    pool.add_backend(spawn_backend("a", StatusCode::OK).await, None);
    pool.add_backend(spawn_backend("b", StatusCode::OK).await, None);
    pool.add_backend(spawn_backend("c", StatusCode::OK).await, None);
    let proxy = proxy_for(pool);

    let mut seen = Vec::new();
    for _ in 0..6 {
        let (status, body) = get(&proxy, "/hello?x=1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("/hello?x=1"), "path not preserved: {}", body);
        seen.push(body.split(' ').next().unwrap().to_string());
    }

    assert_eq!(seen, vec!["b", "c", "a", "b", "c", "a"]);
}

#[tokio::test]
async fn test_http2_client_request_reaches_http1_backend() {
    let mut pool = tcp_pool();
    pool.add_backend(spawn_backend("only", StatusCode::OK).await, None);
    let proxy = proxy_for(pool);

    let mut req = Request::get("/h2").body(Body::empty()).unwrap();
    *req.version_mut() = Version::HTTP_2;
    let response = proxy.handle(req, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(body.starts_with(b"only"));
    assert!(proxy.pool().backends()[0].is_alive());
    assert_eq!(proxy.pool().backends()[0].get_metrics().failed_requests, 0);
}

#[tokio::test]
async fn test_oversized_body_is_rejected_without_forwarding() {
    let mut pool = tcp_pool();
    pool.add_backend(spawn_backend("only", StatusCode::OK).await, None);
    let proxy = Arc::new(
        Proxy::with_transport(
            Arc::new(pool),
            Arc::new(HyperTransport::new(Duration::from_secs(2))),
            RetryPolicy::default(),
            None,
        )
        .with_max_body_bytes(16),
    );

    let req = Request::post("/upload")
        .body(Body::from("this body is longer than sixteen bytes"))
        .unwrap();
    let response = proxy.handle(req, None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(proxy.pool().backends()[0].get_metrics().total_requests, 0);
}

#[tokio::test]
async fn test_failover_marks_unreachable_backend_dead() {
    let mut pool = tcp_pool();
    pool.add_backend(spawn_backend("live", StatusCode::OK).await, None);
    pool.add_backend(dead_url().await, None);
    let proxy = proxy_for(pool);

    // First pick is index 1, the unreachable one.
    let (status, body) = get(&proxy, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("live"));

    let backends = proxy.pool().backends();
    assert!(backends[0].is_alive());
    assert!(!backends[1].is_alive());
    assert_eq!(backends[1].get_metrics().failed_requests, 4);
}

#[tokio::test]
async fn test_all_backends_down_returns_503() {
    let mut pool = tcp_pool();
    pool.add_backend(dead_url().await, None);
    pool.add_backend(dead_url().await, None);
    let proxy = proxy_for(pool);

    let (status, body) = get(&proxy, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Service not available");
    assert_eq!(proxy.pool().healthy_count(), 0);

    // Later requests fail fast without touching the network.
    let (status, _) = get(&proxy, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rate_limited_backend_returns_429() {
    let mut pool = tcp_pool();
    pool.add_backend(spawn_backend("only", StatusCode::OK).await, RateLimit::new(1, Some(1)));
    let proxy = proxy_for(pool);

    let (status, _) = get(&proxy, "/").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get(&proxy, "/").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, "Too many requests");
}

#[tokio::test]
async fn test_health_check_removes_unhealthy_backends() {
    let probe = HttpProbe::new("/health", Duration::from_secs(2)).unwrap();
    let mut pool = ServerPool::new(Arc::new(probe));
    pool.add_backend(spawn_backend("healthy", StatusCode::OK).await, None);
    pool.add_backend(spawn_backend("sick", StatusCode::SERVICE_UNAVAILABLE).await, None);
    pool.add_backend(dead_url().await, None);
    let pool = Arc::new(pool);

    HealthChecker::new(Duration::from_secs(60), pool.clone(), None)
        .run_once()
        .await;

    let backends = pool.backends();
    assert!(backends[0].is_alive());
    assert!(backends[0].latency() > Duration::ZERO);
    assert_eq!(backends[1].status(), (false, Duration::ZERO));
    assert_eq!(backends[2].status(), (false, Duration::ZERO));

    // Only the healthy backend is ever selected now.
    for _ in 0..5 {
        let peer = pool.next_peer().unwrap();
        assert!(Arc::ptr_eq(&peer, &backends[0]));
    }
}

#[tokio::test]
async fn test_status_endpoint_after_health_check() {
    let probe = HttpProbe::new("/health", Duration::from_secs(2)).unwrap();
    let mut pool = ServerPool::new(Arc::new(probe));
    pool.add_backend(spawn_backend("up", StatusCode::OK).await, None);
    pool.add_backend(dead_url().await, None);
    let pool = Arc::new(pool);
    pool.health_check().await;

    let proxy = Arc::new(Proxy::with_transport(
        pool,
        Arc::new(HyperTransport::new(Duration::from_secs(2))),
        RetryPolicy::default(),
        None,
    ));

    let (status, body) = get(&proxy, "/lb/status").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["healthy"], 1);
    assert_eq!(json["backends"][0]["status"], "healthy");
    assert!(json["backends"][0]["latency_ms"].as_f64().unwrap() > 0.0);
    assert_eq!(json["backends"][1]["status"], "unhealthy");
    assert!(json["backends"][1]["last_checked"].is_string());
}
