//! Response cache middleware.
//!
//! Caches GET and HEAD responses with an allow-listed status and replays them
//! without running the handler until they expire or are invalidated.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header, response::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::config::ResponseCacheConfig;
use super::store::Cache;
use crate::infra::telemetry::{
    METRIC_CACHE_BACKEND_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_STORE,
};

/// One stored header. The value keeps its raw bytes, base64-encoded at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedHeader {
    pub name: String,
    #[serde(with = "crate::util::base64_bytes")]
    pub value: Vec<u8>,
}

/// A stored response, replayed verbatim on a hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// In response order; repeated names stay separate entries.
    pub headers: Vec<CachedHeader>,
    #[serde(with = "crate::util::base64_bytes")]
    pub body: Bytes,
}

impl CachedResponse {
    /// Capture a response for storage.
    ///
    /// `Set-Cookie` is dropped so one client's cookies are never replayed to
    /// another. Every other header is kept byte for byte.
    pub fn capture(parts: &Parts, body: Bytes) -> Self {
        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| **name != header::SET_COOKIE)
            .map(|(name, value)| CachedHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();
        Self {
            status: parts.status.as_u16(),
            headers,
            body,
        }
    }

    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            headers: vec![CachedHeader {
                name: header::CONTENT_TYPE.as_str().to_string(),
                value: b"application/json".to_vec(),
            }],
            body: body.into(),
        }
    }

    /// Raw values stored under `name`, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_slice())
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for CachedHeader { name, value } in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!(cache = "response", header = %name, "dropping unreplayable cached header"),
            }
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Shared state for [`response_cache_layer`].
#[derive(Clone)]
pub struct ResponseCacheState {
    pub cache: Cache,
    pub config: Arc<ResponseCacheConfig>,
}

impl ResponseCacheState {
    pub fn new(cache: Cache, config: ResponseCacheConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
        }
    }
}

/// Install with `axum::middleware::from_fn_with_state(state, response_cache_layer)`.
///
/// A failing backend never fails the request: lookup errors count as a miss
/// and store errors are logged while the live response is still returned.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<ResponseCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !matches!(*request.method(), Method::GET | Method::HEAD) {
        return next.run(request).await;
    }
    if state.config.should_skip(&request) {
        debug!(cache = "response", outcome = "skip", "bypassing response cache");
        return next.run(request).await;
    }

    let key = (state.config.key_fn)(&request);

    match state.cache.get::<CachedResponse>(&key).await {
        Ok(Some(cached)) => {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!(cache = "response", outcome = "hit", "serving cached response");
            return cached.into_response();
        }
        Ok(None) => {
            debug!(cache = "response", outcome = "miss", "cache miss, executing handler");
        }
        Err(err) => {
            counter!(METRIC_CACHE_BACKEND_ERROR).increment(1);
            warn!(cache = "response", key = %key, error = %err, "cache lookup failed; treating as miss");
        }
    }
    counter!(METRIC_CACHE_MISS).increment(1);

    let response = next.run(request).await;
    if !state.config.should_store(response.status()) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let limit = state.config.max_body_bytes;
    if body.size_hint().exact().is_some_and(|len| len > limit as u64) {
        debug!(cache = "response", outcome = "too_large", "response body over limit; not cached");
        return Response::from_parts(parts, body);
    }

    let bytes = match buffer_body(body, limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Overflow(body) => {
            debug!(cache = "response", outcome = "too_large", "response body over limit; not cached");
            return Response::from_parts(parts, body);
        }
        Buffered::Failed(err) => {
            warn!(cache = "response", error = %err, "failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let cached = CachedResponse::capture(&parts, bytes.clone());
    match state.cache.set(&key, &cached, state.config.ttl).await {
        Ok(()) => {
            counter!(METRIC_CACHE_STORE).increment(1);
            debug!(cache = "response", outcome = "stored", "caching response");
        }
        Err(err) => {
            counter!(METRIC_CACHE_BACKEND_ERROR).increment(1);
            warn!(cache = "response", key = %key, error = %err, "failed to store response");
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

enum Buffered {
    Complete(Bytes),
    /// The limit was crossed; the body replays what was read, then the rest.
    Overflow(Body),
    Failed(axum::Error),
}

async fn buffer_body(mut body: Body, limit: usize) -> Buffered {
    let mut buffer = BytesMut::new();
    loop {
        match body.frame().await {
            None => return Buffered::Complete(buffer.freeze()),
            Some(Err(err)) => return Buffered::Failed(err),
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buffer.extend_from_slice(&data);
                if buffer.len() > limit {
                    let head = buffer.freeze();
                    let rest = body.into_data_stream();
                    let replay = stream::once(async move { Ok::<_, axum::Error>(head) }).chain(rest);
                    return Buffered::Overflow(Body::from_stream(replay));
                }
            }
        }
    }
}
