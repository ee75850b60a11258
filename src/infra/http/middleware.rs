//! Request correlation and outcome logging for the demo router.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::ErrorReport;
use crate::session::ResolvedSession;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

const MAX_REQUEST_ID_LEN: usize = 128;

/// Per-request correlation data, attached to both the request and the response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Peer address, when the server runs with connect info.
    pub client: Option<IpAddr>,
}

impl RequestContext {
    fn from_request(request: &Request<Body>) -> Self {
        let request_id = request
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| is_acceptable_request_id(value))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Self { request_id, client }
    }
}

/// Upstream ids are reused only when short and made of `[A-Za-z0-9_-]`.
fn is_acceptable_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

/// Reuse or mint `x-request-id` and echo it on the response.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::from_request(&request);
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log every request once it has a response.
///
/// Successes go out at debug. 4xx and 5xx carry the [`ErrorReport`] chain
/// and the session the request ran under, when one was resolved.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ctx = request.extensions().get::<RequestContext>().cloned();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    let request_id = ctx
        .as_ref()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();
    let client = ctx
        .and_then(|ctx| ctx.client)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let session = response
        .extensions()
        .get::<ResolvedSession>()
        .map(|resolved| resolved.log_id.clone())
        .unwrap_or_default();

    if !status.is_client_error() && !status.is_server_error() {
        debug!(
            target = "larder::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            session = %session,
            request_id = %request_id,
            "request served",
        );
        return response;
    }

    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "larder::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            session = %session,
            client = %client,
            request_id = %request_id,
            "request failed",
        );
    } else {
        warn!(
            target = "larder::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail = %detail,
            session = %session,
            client = %client,
            request_id = %request_id,
            "client request error",
        );
    }

    response
}
