use crate::engine::WafState;
use crate::extractor::RequestContext;
use crate::recorder::ResponseRecorder;
use crate::waf::Waf;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::Response;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-request id assigned by the middleware; downstream handlers can read
/// it from the request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Installs the firewall in front of an inner service.
#[derive(Clone)]
pub struct WafLayer {
    waf: Arc<Waf>,
}

impl WafLayer {
    pub fn new(waf: Arc<Waf>) -> Self {
        Self { waf }
    }
}

impl<S> Layer<S> for WafLayer {
    type Service = WafService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        WafService {
            inner,
            waf: Arc::clone(&self.waf),
        }
    }
}

/// The single canonical pipeline: request id, metrics-endpoint bypass,
/// body buffering, phases 1-2, downstream call, response recording,
/// phases 3-4, replay or custom response.
#[derive(Clone)]
pub struct WafService<S> {
    inner: S,
    waf: Arc<Waf>,
}

impl<S> Service<Request<Body>> for WafService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let waf = Arc::clone(&self.waf);
        let clone = self.inner.clone();
        // The clone dance keeps the ready service for this call
        let inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { Ok(process(waf, inner, req).await) })
    }
}

async fn process<S>(waf: Arc<Waf>, inner: S, req: Request<Body>) -> Response
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Send + 'static,
    S::Future: Send,
{
    // Metrics requests bypass rule evaluation entirely
    if let Some(endpoint) = waf.metrics_endpoint() {
        if req.uri().path() == endpoint {
            return metrics_response(&waf);
        }
    }

    let request_id = Uuid::new_v4().to_string();
    waf.metrics().record_request();

    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let (mut parts, body) = req.into_parts();

    // The body is buffered exactly once; the downstream handler sees the
    // identical bytes.
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Failed to read request body");
            waf.metrics().record_blocked();
            return plain_status(StatusCode::BAD_REQUEST);
        }
    };

    parts.extensions.insert(RequestId(request_id.clone()));

    let ctx = RequestContext {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        version: parts.version,
        headers: parts.headers.clone(),
        remote_ip,
        body: body_bytes.clone(),
    };

    info!(
        request_id = %request_id,
        method = %ctx.method,
        uri = %ctx.uri,
        client_ip = %remote_ip,
        user_agent = ctx.headers.get(http::header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or(""),
        "WAF evaluation started"
    );

    let mut state = WafState::new(request_id.clone());

    waf.engine().run_phase(1, &ctx, None, &mut state);
    waf.engine().run_phase(2, &ctx, None, &mut state);
    if state.blocked {
        waf.metrics().record_blocked();
        log_completion(&request_id, &state);
        return block_response(&waf, &state);
    }

    let downstream_req = Request::from_parts(parts, Body::from(body_bytes));
    let response = match inner.oneshot(downstream_req).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = match resp_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to read downstream response body");
            waf.metrics().record_allowed();
            return plain_status(StatusCode::BAD_GATEWAY);
        }
    };
    let recorder = ResponseRecorder::new(resp_parts.status, resp_parts.headers, resp_bytes);

    waf.engine().run_phase(3, &ctx, Some(&recorder), &mut state);
    waf.engine().run_phase(4, &ctx, Some(&recorder), &mut state);
    if state.blocked {
        waf.metrics().record_blocked();
        log_completion(&request_id, &state);
        return block_response(&waf, &state);
    }

    waf.metrics().record_allowed();
    log_completion(&request_id, &state);
    recorder.into_response()
}

fn log_completion(request_id: &str, state: &WafState) {
    info!(
        request_id = %request_id,
        total_score = state.total_score,
        blocked = state.blocked,
        status_code = state.status_code.as_u16(),
        "WAF evaluation completed"
    );
}

/// The configured custom response for the block status, or the bare status.
fn block_response(waf: &Waf, state: &WafState) -> Response {
    let status = state.status_code;
    let Some(custom) = waf.custom_response(status.as_u16()) else {
        return plain_status(status);
    };

    let mut builder = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, &custom.content_type);
    for (name, value) in &custom.headers {
        builder = builder.header(name, value);
    }
    match builder.body(Body::from(custom.body.clone())) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Invalid custom response, falling back to bare status");
            plain_status(status)
        }
    }
}

fn plain_status(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn metrics_response(waf: &Waf) -> Response {
    match serde_json::to_vec(&waf.metrics_snapshot()) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize metrics snapshot");
            plain_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
