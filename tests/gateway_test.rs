//! End-to-end tests: real upstream servers behind fully built route chains.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

use routegate::cache::ResponseCache;
use routegate::config::Config;
use routegate::error::{full_body, GatewayBody};
use routegate::handler::ClientAddr;
use routegate::proxy::build_upstream_client;
use routegate::recorder::ResponseRecord;
use routegate::router::Router;

type UpstreamFn =
    Arc<dyn Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static>;

/// Spawn a real HTTP server on an ephemeral port.
async fn spawn_upstream(handler: UpstreamFn) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, hyper::Error>(handler(req)) }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

fn upstream_responding_with(body: &'static str) -> UpstreamFn {
    Arc::new(move |_req| Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
}

fn build_router(yaml: &str) -> Arc<Router> {
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate("0.1.0").unwrap();
    Arc::new(
        Router::build(
            &config,
            build_upstream_client(),
            Arc::new(ResponseCache::new()),
        )
        .unwrap(),
    )
}

fn gateway_request(path: &str, client: &str) -> Request<GatewayBody> {
    let mut req = Request::builder()
        .uri(path)
        .header(hyper::header::HOST, "gw.test")
        .body(full_body(""))
        .unwrap();
    req.extensions_mut()
        .insert(ClientAddr(client.parse().unwrap()));
    req
}

async fn body_string(response: Response<GatewayBody>) -> String {
    let record = ResponseRecord::capture(response).await.unwrap();
    String::from_utf8(record.body().to_vec()).unwrap()
}

#[tokio::test]
async fn longest_prefix_routing_picks_deepest_route() {
    let api = spawn_upstream(upstream_responding_with("api")).await;
    let users = spawn_upstream(upstream_responding_with("users")).await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /api
        destination: http://{api}
      - path: /api/users
        destination: http://{users}
"#
    ));

    let handler = router.lookup("gw.test", "/api/users/42").unwrap();
    let response = handler.handle(gateway_request("/api/users/42", "10.0.0.1:1000")).await;
    assert_eq!(body_string(response).await, "users");

    let handler = router.lookup("gw.test", "/api/posts").unwrap();
    let response = handler.handle(gateway_request("/api/posts", "10.0.0.1:1000")).await;
    assert_eq!(body_string(response).await, "api");

    assert!(router.lookup("gw.test", "/other").is_none());
}

#[tokio::test]
async fn weighted_round_robin_follows_the_cycle() {
    let a = spawn_upstream(upstream_responding_with("A")).await;
    let b = spawn_upstream(upstream_responding_with("B")).await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /
        backend:
          balance_policy: round-robin
          servers:
            - url: http://{a}
              weight: 1
            - url: http://{b}
              weight: 2
"#
    ));

    let handler = router.lookup("gw.test", "/").unwrap();
    let mut picks = Vec::new();
    for i in 0..6 {
        let response = handler
            .handle(gateway_request("/", &format!("10.0.0.1:{}", 2000 + i)))
            .await;
        picks.push(body_string(response).await);
    }

    assert_eq!(picks, vec!["A", "B", "B", "A", "B", "B"]);
}

#[tokio::test]
async fn cached_response_survives_upstream_change_until_expiry() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);
    let upstream: UpstreamFn = Arc::new(move |_req| {
        let version = counter_clone.fetch_add(1, Ordering::SeqCst) + 1;
        let mut response = Response::new(Full::new(Bytes::from(format!("v{version}"))));
        response.headers_mut().insert(
            hyper::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=1"),
        );
        response
    });
    let addr = spawn_upstream(upstream).await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /data
        destination: http://{addr}
        cache: true
"#
    ));

    let handler = router.lookup("gw.test", "/data").unwrap();

    let first = handler.handle(gateway_request("/data", "10.0.0.1:3000")).await;
    assert_eq!(body_string(first).await, "v1");

    // half a second later the cache still serves v1
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = handler.handle(gateway_request("/data", "10.0.0.1:3001")).await;
    assert_eq!(body_string(second).await, "v1");

    // past the TTL the chain runs again
    tokio::time::sleep(Duration::from_millis(1600)).await;
    let third = handler.handle(gateway_request("/data", "10.0.0.1:3002")).await;
    assert_eq!(body_string(third).await, "v2");
}

#[tokio::test]
async fn rate_limit_denies_second_request_within_window() {
    let addr = spawn_upstream(upstream_responding_with("ok")).await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /limited
        destination: http://{addr}
        ratelimits:
          - ip-1/s
"#
    ));

    let handler = router.lookup("gw.test", "/limited").unwrap();

    let first = handler
        .handle(gateway_request("/limited", "10.9.9.9:1000"))
        .await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = handler
        .handle(gateway_request("/limited", "10.9.9.9:1001"))
        .await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers().get("X-RateLimit-Limit").unwrap(), "1");
    assert_eq!(second.headers().get("X-RateLimit-Remaining").unwrap(), "0");

    // another identity is not throttled
    let other = handler
        .handle(gateway_request("/limited", "10.9.9.8:1000"))
        .await;
    assert_eq!(other.status(), StatusCode::OK);
}

/// An upstream that waits before answering, without blocking the runtime.
async fn spawn_slow_upstream(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(
                        b"too late",
                    ))))
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn slow_upstream_times_out_with_504() {
    let addr = spawn_slow_upstream(Duration::from_secs(5)).await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /slow
        destination: http://{addr}
        timeout: 1
"#
    ));

    let handler = router.lookup("gw.test", "/slow").unwrap();
    let start = std::time::Instant::now();
    let response = handler.handle(gateway_request("/slow", "10.0.0.1:4000")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn gzip_round_trips_when_client_accepts_it() {
    let addr = spawn_upstream(upstream_responding_with(
        "a body that zips well zips well zips well",
    ))
    .await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /z
        destination: http://{addr}
        gzip: true
"#
    ));

    let handler = router.lookup("gw.test", "/z").unwrap();

    let mut req = gateway_request("/z", "10.0.0.1:5000");
    req.headers_mut().insert(
        hyper::header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip"),
    );
    let response = handler.handle(req).await;
    assert_eq!(
        response.headers().get(hyper::header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );

    let compressed = response.into_body().collect().await.unwrap().to_bytes();
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_ref());
    let mut body = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut body).unwrap();
    assert_eq!(body, "a body that zips well zips well zips well");

    // without Accept-Encoding the body is untouched
    let response = handler.handle(gateway_request("/z", "10.0.0.1:5001")).await;
    assert!(response.headers().get(hyper::header::CONTENT_ENCODING).is_none());
    assert_eq!(
        body_string(response).await,
        "a body that zips well zips well zips well"
    );
}

#[tokio::test]
async fn unreachable_upstream_maps_to_502() {
    let router = build_router(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    endpoints:
      - path: /down
        destination: http://127.0.0.1:1
"#,
    );

    let handler = router.lookup("gw.test", "/down").unwrap();
    let response = handler.handle(gateway_request("/down", "10.0.0.1:6000")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn anomaly_header_reaches_upstream_and_cookie_stays_private() {
    let upstream: UpstreamFn = Arc::new(|req| {
        let score = req
            .headers()
            .get("X-Anomaly-Score")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("missing")
            .to_string();
        let cookie = req
            .headers()
            .get(hyper::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        Response::new(Full::new(Bytes::from(format!("{score}|{cookie}"))))
    });
    let addr = spawn_upstream(upstream).await;

    let router = build_router(&format!(
        r#"
version: "0.1.0"
host: 127.0.0.1
port: 8080
services:
  - domain: gw.test
    anomaly_detection:
      active: true
    endpoints:
      - path: /shop
        destination: http://{addr}
"#
    ));

    let handler = router.lookup("gw.test", "/shop").unwrap();
    let response = handler.handle(gateway_request("/shop", "10.0.0.1:7000")).await;

    // new session: tracking cookie issued to the client
    let set_cookie = response
        .headers()
        .get(hyper::header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("rg-trc="));

    let body = body_string(response).await;
    // below the scoring threshold the header reads 0.00, and the tracker
    // cookie never reached the upstream
    assert!(body.starts_with("0.00|"), "unexpected body: {body}");
    assert!(!body.contains("rg-trc"));
}
