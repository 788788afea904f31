use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gatehouse_gateway::config::{GatewayConfig, JwtAlgorithm};
use gatehouse_gateway::server::GatewayServer;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "integration-test-secret";

fn unused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind ephemeral port")
        .local_addr()
        .expect("listener has no local addr")
        .port()
}

fn write_routes(routes: serde_json::Value) -> NamedTempFile {
    let file = NamedTempFile::new().expect("routes file");
    std::fs::write(file.path(), routes.to_string()).expect("write routes");
    file
}

fn account_routes(upstream_url: &str) -> serde_json::Value {
    json!([{
        "id": "account",
        "path_prefix": "/account",
        "upstream": upstream_url,
    }])
}

fn base_config(routes_file: &Path, port: u16) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port,
        routes_file: routes_file.to_path_buf(),
        jwt_secret: Some(SECRET.to_string()),
        jwt_public_key_path: None,
        jwt_algorithm: JwtAlgorithm::HS256,
        jwt_leeway_secs: 30,
        quota_redis_url: None,
        quota_fail_open: false,
        quota_timeout_ms: 500,
        default_rate_limit: 1000,
        // Wide default window so tests cannot straddle a boundary.
        default_rate_window_secs: 3600,
        upstream_timeout_secs: 2,
        request_timeout_secs: 10,
        max_body_size_bytes: 1024 * 1024,
        forward_auth_header: true,
        tls_cert_path: None,
        tls_key_path: None,
        log_level: "warn".to_string(),
    }
}

fn mint_token(sub: &str, exp_offset_secs: i64) -> String {
    mint_token_with(SECRET, sub, exp_offset_secs)
}

fn mint_token_with(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": sub,
        "iat": now,
        "exp": now + exp_offset_secs,
        "scope": "account:read",
        "email": format!("{}@example.com", sub),
        "username": sub,
    });

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token should encode")
}

async fn start_gateway(
    config: GatewayConfig,
) -> (Arc<GatewayServer>, JoinHandle<Result<()>>, String) {
    let addr = format!("{}:{}", config.host, config.port);
    let base_url = format!("http://{}", addr);
    config.validate().expect("config validation failed");
    let server = Arc::new(
        GatewayServer::new(config)
            .await
            .expect("failed to construct gateway server"),
    );
    let handle = tokio::spawn(Arc::clone(&server).run());
    wait_for_port(&addr).await;
    (server, handle, base_url)
}

async fn wait_for_port(addr: &str) {
    for _ in 0..20 {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => return,
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("gateway [{}] did not become ready in time", addr);
}

async fn teardown(handle: JoinHandle<Result<()>>) {
    handle.abort();
    let _ = handle.await;
}

fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("client")
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credentials_on_a_protected_route_yield_401() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/me"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let routes = write_routes(account_routes(&upstream.uri()));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/me", base_url))
        .send()
        .await?;

    assert_eq!(response.status(), 401);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("UNAUTHENTICATED"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn valid_token_forwards_and_relays_the_upstream_response() -> Result<()> {
    let token = mint_token("user-1", 3600);

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/me"))
        .and(header(
            "Authorization",
            format!("Bearer {}", token).as_str(),
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Upstream", "account")
                .set_body_json(json!({ "id": "user-1", "email": "user-1@example.com" })),
        )
        .mount(&upstream)
        .await;

    let routes = write_routes(account_routes(&upstream.uri()));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/me", base_url))
        .bearer_auth(&token)
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("X-Upstream").unwrap(), "account");
    assert!(response.headers().get("X-RateLimit-Remaining").is_some());
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body, json!({ "id": "user-1", "email": "user-1@example.com" }));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_error_statuses_relay_verbatim() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/me"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({ "error": "maintenance" })),
        )
        .mount(&upstream)
        .await;

    let routes = write_routes(account_routes(&upstream.uri()));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/me", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .send()
        .await?;

    // An upstream-reported error is the upstream's answer, not the
    // gateway's; it must not be remapped to 502.
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body, json!({ "error": "maintenance" }));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_over_the_route_limit_are_rejected_with_retry_after() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/me"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&upstream)
        .await;

    let routes = write_routes(json!([{
        "id": "account",
        "path_prefix": "/account",
        "upstream": upstream.uri(),
        "rate_limit": { "requests": 3, "window_secs": 3600 },
    }]));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let client = http_client();
    let token = mint_token("rate-limited-user", 3600);

    for expected_remaining in ["2", "1", "0"] {
        let response = client
            .get(format!("{}/account/me", base_url))
            .bearer_auth(&token)
            .send()
            .await?;
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("X-RateLimit-Remaining").unwrap(),
            expected_remaining
        );
    }

    let response = client
        .get(format!("{}/account/me", base_url))
        .bearer_auth(&token)
        .send()
        .await?;

    assert_eq!(response.status(), 429);
    let retry_after: u64 = response
        .headers()
        .get("Retry-After")
        .expect("Retry-After header")
        .to_str()?
        .parse()?;
    assert!(retry_after > 0);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("RATE_LIMITED"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn public_routes_skip_auth_but_are_rate_limited_by_client_ip() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .expect(2)
        .mount(&upstream)
        .await;

    let routes = write_routes(json!([{
        "id": "status",
        "path_prefix": "/status",
        "upstream": upstream.uri(),
        "public": true,
        "rate_limit": { "requests": 2, "window_secs": 3600 },
    }]));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let client = http_client();

    for _ in 0..2 {
        let response = client.get(format!("{}/status", base_url)).send().await?;
        assert_eq!(response.status(), 200);
    }

    let response = client.get(format!("{}/status", base_url)).send().await?;
    assert_eq!(response.status(), 429);

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_paths_are_401_without_credentials_and_404_with() -> Result<()> {
    let upstream = MockServer::start().await;
    let routes = write_routes(account_routes(&upstream.uri()));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let client = http_client();

    // Authentication precedes routing: anonymous probing of unknown
    // paths reveals nothing about the route table.
    let response = client.get(format!("{}/wallet/balance", base_url)).send().await?;
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("{}/wallet/balance", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .send()
        .await?;
    assert_eq!(response.status(), 404);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("NO_ROUTE"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_and_tampered_tokens_are_distinct_401s() -> Result<()> {
    let upstream = MockServer::start().await;
    let routes = write_routes(account_routes(&upstream.uri()));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let client = http_client();

    let response = client
        .get(format!("{}/account/me", base_url))
        .bearer_auth(mint_token("user-1", -120))
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("TOKEN_EXPIRED"));

    let response = client
        .get(format!("{}/account/me", base_url))
        .bearer_auth(mint_token_with("wrong-secret", "user-1", 3600))
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("UNAUTHENTICATED"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_upstream_returns_502_within_the_deadline() -> Result<()> {
    let dead_port = unused_port();
    let routes = write_routes(account_routes(&format!("http://127.0.0.1:{}", dead_port)));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/me", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .send()
        .await?;

    assert_eq!(response.status(), 502);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("UPSTREAM_UNAVAILABLE"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_upstream_times_out_as_504() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&upstream)
        .await;

    let routes = write_routes(json!([{
        "id": "account",
        "path_prefix": "/account",
        "upstream": upstream.uri(),
        "timeout_secs": 1,
    }]));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/slow", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .send()
        .await?;

    assert_eq!(response.status(), 504);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("TIMEOUT"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn route_filters_rewrite_the_forwarded_request() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/7"))
        .and(header("X-Gateway", "gatehouse"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 7 })))
        .mount(&upstream)
        .await;

    let routes = write_routes(json!([{
        "id": "account",
        "path_prefix": "/account",
        "upstream": upstream.uri(),
        "filters": [
            { "type": "strip-prefix", "segments": 1 },
            { "type": "add-request-header", "name": "X-Gateway", "value": "gatehouse" },
        ],
    }]));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/users/7", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body, json!({ "id": 7 }));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn request_ids_propagate_end_to_end() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/me"))
        .and(header("X-Request-Id", "trace-me-123"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let routes = write_routes(account_routes(&upstream.uri()));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client()
        .get(format!("{}/account/me", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .header("X-Request-Id", "trace-me-123")
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("X-Request-Id").unwrap(),
        "trace-me-123"
    );

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_swaps_the_whole_route_table() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let routes = write_routes(json!([{
        "id": "old",
        "path_prefix": "/old",
        "upstream": upstream.uri(),
    }]));
    let (server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let client = http_client();
    let token = mint_token("user-1", 3600);

    let response = client
        .get(format!("{}/old/thing", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    std::fs::write(
        routes.path(),
        json!([{
            "id": "new",
            "path_prefix": "/new",
            "upstream": upstream.uri(),
        }])
        .to_string(),
    )?;
    server.reload_routes().expect("reload should succeed");

    let response = client
        .get(format!("{}/old/thing", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("{}/new/thing", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_answers_without_auth_or_routing() -> Result<()> {
    let routes = write_routes(json!([]));
    let (_server, handle, base_url) =
        start_gateway(base_config(routes.path(), unused_port())).await;

    let response = http_client().get(format!("{}/ping", base_url)).send().await?;

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "pong");

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_request_bodies_are_rejected_before_forwarding() -> Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/account/import"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let routes = write_routes(account_routes(&upstream.uri()));
    let mut config = base_config(routes.path(), unused_port());
    config.max_body_size_bytes = 16;
    let (_server, handle, base_url) = start_gateway(config).await;

    let response = http_client()
        .post(format!("{}/account/import", base_url))
        .bearer_auth(mint_token("user-1", 3600))
        .body(vec![b'x'; 64])
        .send()
        .await?;

    assert_eq!(response.status(), 413);
    let payload: serde_json::Value = response.json().await?;
    assert_eq!(payload["error"], json!("PAYLOAD_TOO_LARGE"));

    teardown(handle).await;
    Ok(())
}

