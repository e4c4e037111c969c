//! End-to-end tests for the WAF middleware
//!
//! Each test builds a real `Waf`, wraps a small axum router with the
//! firewall layer, and drives it with in-process requests.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use waf_node::config::{CustomResponseConfig, RateLimitConfig, WafNodeConfig};
use waf_node::{Waf, WafLayer};

struct TestNode {
    waf: Arc<Waf>,
    app: Router,
    _rule_files: Vec<tempfile::NamedTempFile>,
    _aux_files: Vec<tempfile::NamedTempFile>,
}

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

async fn upstream_echo(body: String) -> String {
    body
}

async fn upstream_ok() -> &'static str {
    "origin says hi"
}

async fn upstream_with_header() -> Response {
    (
        [("x-backend-debug", "enabled")],
        "response with marked header",
    )
        .into_response()
}

async fn upstream_secret() -> &'static str {
    "this page contains internal-marker text"
}

async fn build_node(
    rules_json: &str,
    customize: impl FnOnce(&mut WafNodeConfig, &mut Vec<tempfile::NamedTempFile>),
) -> TestNode {
    let rule_file = write_temp(rules_json);

    let mut config = WafNodeConfig::default();
    config.waf.rule_files = vec![rule_file.path().to_str().unwrap().to_string()];

    let mut aux_files = Vec::new();
    customize(&mut config, &mut aux_files);

    let waf = Waf::new(config).await.unwrap();

    let app = Router::new()
        .route("/echo", post(upstream_echo))
        .route("/debug-header", get(upstream_with_header))
        .route("/internal", get(upstream_secret))
        .fallback(upstream_ok)
        .layer(WafLayer::new(Arc::clone(&waf)));

    TestNode {
        waf,
        app,
        _rule_files: vec![rule_file],
        _aux_files: aux_files,
    }
}

fn request(uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo::<SocketAddr>(
            format!("{ip}:44312").parse().unwrap(),
        ))
        .body(Body::empty())
        .unwrap()
}

fn post_request(uri: &str, ip: &str, content_type: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", content_type)
        .extension(ConnectInfo::<SocketAddr>(
            format!("{ip}:44312").parse().unwrap(),
        ))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

const NO_RULES: &str = "[]";

#[tokio::test]
async fn test_clean_request_passes_through() {
    let node = build_node(NO_RULES, |_, _| {}).await;

    let response = node.app.clone().oneshot(request("/hello", "198.51.100.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "origin says hi");

    let snapshot = node.waf.metrics_snapshot();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.allowed_requests, 1);
    assert_eq!(snapshot.blocked_requests, 0);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_ip_blacklist_hit() {
    let node = build_node(NO_RULES, |config, aux| {
        let blacklist = write_temp("# blocked\n10.0.0.0/8\n");
        config.waf.ip_blacklist_file =
            Some(blacklist.path().to_str().unwrap().to_string());
        aux.push(blacklist);
    })
    .await;

    let response = node.app.clone().oneshot(request("/", "10.5.6.7")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let allowed = node.app.clone().oneshot(request("/", "11.0.0.1")).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let snapshot = node.waf.metrics_snapshot();
    assert_eq!(snapshot.blocked_requests, 1);
    assert_eq!(snapshot.allowed_requests, 1);
    assert_eq!(
        snapshot.total_requests,
        snapshot.blocked_requests + snapshot.allowed_requests
    );
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_score_accumulation_blocks_at_threshold() {
    let rules = r#"[
        {"id": "scan-a", "phase": 1, "pattern": "acunetix", "targets": ["USER_AGENT"], "score": 3},
        {"id": "scan-b", "phase": 1, "pattern": "acunetix", "targets": ["URI,USER_AGENT"], "score": 3}
    ]"#;
    let node = build_node(rules, |config, _| {
        config.waf.anomaly_threshold = 5;
    })
    .await;

    let req = Request::builder()
        .uri("/")
        .header("user-agent", "acunetix-scanner")
        .extension(ConnectInfo::<SocketAddr>("198.51.100.2:9999".parse().unwrap()))
        .body(Body::empty())
        .unwrap();

    let response = node.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(node.waf.metrics().rule_hit_count("scan-a"), 1);
    assert_eq!(node.waf.metrics().rule_hit_count("scan-b"), 1);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_log_only_rule_lets_request_through() {
    let rules = r#"[
        {"id": "watcher", "phase": 1, "pattern": "^/admin", "targets": ["PATH"], "score": 0, "mode": "log"}
    ]"#;
    let node = build_node(rules, |_, _| {}).await;

    let response = node.app.clone().oneshot(request("/admin/panel", "198.51.100.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = node.waf.metrics_snapshot();
    assert_eq!(snapshot.allowed_requests, 1);
    assert_eq!(snapshot.blocked_requests, 0);
    assert_eq!(snapshot.rule_hits.get("watcher"), Some(&1));
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_returns_429_on_third_request() {
    let node = build_node(NO_RULES, |config, _| {
        config.rate_limit = RateLimitConfig {
            enabled: true,
            requests: 2,
            window_seconds: 60,
            cleanup_interval_seconds: 60,
            paths: Vec::new(),
            match_all_paths: true,
        };
    })
    .await;

    for _ in 0..2 {
        let response = node.app.clone().oneshot(request("/", "198.51.100.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = node.app.clone().oneshot(request("/", "198.51.100.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different client is not limited
    let response = node.app.clone().oneshot(request("/", "198.51.100.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_hot_reload_drops_rule() {
    let rules = r#"[
        {"id": "temp", "phase": 1, "pattern": "^/a$", "targets": ["PATH"], "score": 9, "mode": "block"}
    ]"#;
    let node = build_node(rules, |_, _| {}).await;

    let response = node.app.clone().oneshot(request("/a", "198.51.100.6")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Rewrite the rule file without the rule and reload
    std::fs::write(node._rule_files[0].path(), "[]").unwrap();
    node.waf.reload().unwrap();

    let response = node.app.clone().oneshot(request("/a", "198.51.100.6")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_json_path_rule_blocks() {
    let rules = r#"[
        {"id": "json-root", "phase": 2, "pattern": "^root$", "targets": ["JSON_PATH:u.n"], "score": 1, "mode": "block"}
    ]"#;
    let node = build_node(rules, |_, _| {}).await;

    let response = node
        .app
        .clone()
        .oneshot(post_request(
            "/echo",
            "198.51.100.7",
            "application/json",
            r#"{"u":{"n":"root"}}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = node
        .app
        .clone()
        .oneshot(post_request(
            "/echo",
            "198.51.100.7",
            "application/json",
            r#"{"u":{"n":"guest"}}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_request_body_reaches_downstream_after_extraction() {
    let rules = r#"[
        {"id": "body-watch", "phase": 2, "pattern": "payload", "targets": ["BODY"], "score": 0, "mode": "log"}
    ]"#;
    let node = build_node(rules, |_, _| {}).await;

    let response = node
        .app
        .clone()
        .oneshot(post_request(
            "/echo",
            "198.51.100.8",
            "text/plain",
            "payload-for-the-origin",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // The origin saw the identical bytes even though BODY was extracted
    assert_eq!(body_text(response).await, "payload-for-the-origin");
    assert_eq!(node.waf.metrics().rule_hit_count("body-watch"), 1);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_response_header_rule_blocks_in_phase_three() {
    let rules = r#"[
        {"id": "hdr", "phase": 3, "pattern": "enabled", "targets": ["RESPONSE_HEADERS:x-backend-debug"], "score": 9, "mode": "block"}
    ]"#;
    let node = build_node(rules, |_, _| {}).await;

    let response = node
        .app
        .clone()
        .oneshot(request("/debug-header", "198.51.100.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // The recorded origin response was discarded
    assert_eq!(body_text(response).await, "");
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_response_body_rule_blocks_in_phase_four() {
    let rules = r#"[
        {"id": "leak", "phase": 4, "pattern": "internal-marker", "targets": ["RESPONSE_BODY"], "score": 9, "mode": "block"}
    ]"#;
    let node = build_node(rules, |_, _| {}).await;

    let response = node.app.clone().oneshot(request("/internal", "198.51.100.10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = node.app.clone().oneshot(request("/other", "198.51.100.10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_custom_response_body() {
    let rules = r#"[
        {"id": "deny", "phase": 1, "pattern": "^/forbidden$", "targets": ["PATH"], "score": 9, "mode": "block"}
    ]"#;
    let node = build_node(rules, |config, _| {
        config.custom_responses.push(CustomResponseConfig {
            status: 403,
            content_type: "text/html".to_string(),
            body: Some("<h1>Access Denied</h1>".to_string()),
            body_file: None,
            headers: HashMap::from([(
                "x-denied-by".to_string(),
                "waf-node".to_string(),
            )]),
        });
    })
    .await;

    let response = node.app.clone().oneshot(request("/forbidden", "198.51.100.11")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(response.headers()["x-denied-by"], "waf-node");
    assert_eq!(body_text(response).await, "<h1>Access Denied</h1>");
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_metrics_endpoint_bypasses_rules() {
    let rules = r#"[
        {"id": "block-all", "phase": 1, "pattern": ".", "targets": ["PATH"], "score": 9, "mode": "block"}
    ]"#;
    let node = build_node(rules, |config, _| {
        config.waf.metrics_endpoint = Some("/waf/metrics".to_string());
    })
    .await;

    // Every normal request is blocked by the catch-all rule
    let response = node.app.clone().oneshot(request("/anything", "198.51.100.12")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The metrics path is exempt and serves the snapshot
    let response = node.app.clone().oneshot(request("/waf/metrics", "198.51.100.12")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");

    let body = body_text(response).await;
    let snapshot: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(snapshot["total_requests"], 1);
    assert_eq!(snapshot["blocked_requests"], 1);
    assert_eq!(snapshot["allowed_requests"], 0);
    assert_eq!(snapshot["rule_hits"]["block-all"], 1);
    assert_eq!(snapshot["rule_hits_by_phase"]["1"], 1);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_dns_blacklist_blocks_host() {
    let node = build_node(NO_RULES, |config, aux| {
        let blacklist = write_temp("bad.example.com\n# comment\n");
        config.waf.dns_blacklist_file =
            Some(blacklist.path().to_str().unwrap().to_string());
        aux.push(blacklist);
    })
    .await;

    let req = Request::builder()
        .uri("/")
        .header("host", "bad.example.com")
        .extension(ConnectInfo::<SocketAddr>("198.51.100.13:1234".parse().unwrap()))
        .body(Body::empty())
        .unwrap();
    let response = node.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let req = Request::builder()
        .uri("/")
        .header("host", "good.example.com")
        .extension(ConnectInfo::<SocketAddr>("198.51.100.13:1234".parse().unwrap()))
        .body(Body::empty())
        .unwrap();
    let response = node.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    node.waf.shutdown().await;
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let rule_file = write_temp(NO_RULES);
    let toml = format!(
        r#"
[waf]
rule_files = ["{}"]
anomaly_threshold = 7
metrics_endpoint = "/waf/metrics"

[rate_limit]
enabled = true
requests = 50
window_seconds = 10

[logging]
severity = "debug"
json = true
"#,
        rule_file.path().display()
    );
    let mut config_file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    config_file.write_all(toml.as_bytes()).unwrap();
    config_file.flush().unwrap();

    let config = WafNodeConfig::from_file(config_file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.waf.anomaly_threshold, 7);
    assert_eq!(config.waf.metrics_endpoint.as_deref(), Some("/waf/metrics"));
    assert!(config.rate_limit.enabled);
    assert_eq!(config.rate_limit.requests, 50);
    assert_eq!(config.logging.severity, "debug");
    assert!(config.logging.json);
    assert!(config.validate().is_ok());
}
