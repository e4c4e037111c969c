use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use http::StatusCode;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use waf_node::{reload, Waf, WafLayer, WafNodeConfig};

/// Forwarding state for the origin side
#[derive(Clone)]
struct ProxyState {
    client: Client<HttpConnector, Body>,
    backend_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/waf.toml".to_string());
    let config = WafNodeConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    init_tracing(&config);

    info!(config = %config_path, "Starting WAF node");
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let listen_addr: SocketAddr = config.listen_addr().context("Invalid listen address")?;
    let backend_url = config.network.backend_url.clone();

    let waf = Waf::new(config).await.context("Failed to initialize WAF")?;
    let _reload_watcher = reload::start(Arc::clone(&waf), waf.shutdown_rx())
        .context("Failed to start reload watcher")?;

    let state = ProxyState {
        client: Client::builder(TokioExecutor::new()).build_http(),
        backend_url,
    };

    let app = Router::new()
        .fallback(forward)
        .with_state(state)
        .layer(WafLayer::new(Arc::clone(&waf)));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "WAF node listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    waf.shutdown().await;
    Ok(())
}

fn init_tracing(config: &WafNodeConfig) {
    let default_filter = format!("waf_node={}", config.logging.severity);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Forward an allowed request to the configured origin.
async fn forward(State(state): State<ProxyState>, req: axum::extract::Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{}{}", state.backend_url.trim_end_matches('/'), path_and_query);

    let (mut parts, body) = req.into_parts();
    parts.uri = match target.parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!(target = %target, error = %e, "Invalid upstream URI");
            return bare_status(StatusCode::BAD_GATEWAY);
        }
    };
    // The client derives Host from the target URI
    parts.headers.remove(http::header::HOST);

    match state.client.request(http::Request::from_parts(parts, body)).await {
        Ok(response) => response.map(Body::new),
        Err(e) => {
            error!(target = %target, error = %e, "Upstream request failed");
            bare_status(StatusCode::BAD_GATEWAY)
        }
    }
}

fn bare_status(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
