use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header::COOKIE},
    middleware,
    routing::get,
};
use larder::{
    cache::{
        Cache, FixedWindowLimiter, ResponseCacheConfig, ResponseCacheState, response_cache_layer,
    },
    infra::{
        http::{HttpState, build_router},
        kv::{KeyTtl, KvBackend, KvError, MemoryKv},
        telemetry,
    },
    session::{MemorySessionStore, SessionConfig, SessionState},
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serial_test::serial;
use tower::ServiceExt;

fn app() -> Router {
    let cache = Cache::new(Arc::new(MemoryKv::new()));
    build_router(HttpState::new(
        SessionState::new(Arc::new(MemorySessionStore::new()), SessionConfig::default()),
        cache.clone(),
        ResponseCacheState::new(cache.clone(), ResponseCacheConfig::default()),
        FixedWindowLimiter::new(cache, Duration::from_secs(60), 1_000),
    ))
}

#[tokio::test]
#[serial]
async fn request_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let app = app();
    let mut cookie: Option<String> = None;
    for _ in 0..2 {
        let mut builder = Request::builder().method(Method::GET).uri("/users");
        if let Some(cookie) = cookie.as_deref() {
            builder = builder.header(COOKIE, cookie);
        }
        let request = builder.body(Body::empty()).expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);

        cookie = response
            .headers()
            .get("set-cookie")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::to_string);
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        telemetry::METRIC_CACHE_HIT,
        telemetry::METRIC_CACHE_MISS,
        telemetry::METRIC_CACHE_STORE,
        telemetry::METRIC_SESSION_CREATED,
        telemetry::METRIC_SESSION_RESOLVED,
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

/// Backend whose every call fails.
struct UnreachableKv;

fn unavailable(key: &str, op: &'static str) -> KvError {
    KvError::WrongType {
        key: key.to_string(),
        op,
    }
}

#[async_trait]
impl KvBackend for UnreachableKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Err(unavailable(key, "get"))
    }

    async fn set(&self, key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), KvError> {
        Err(unavailable(key, "set"))
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64, KvError> {
        Err(unavailable("*", "delete"))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Err(unavailable(key, "exists"))
    }

    async fn incr_by(&self, key: &str, _delta: i64) -> Result<i64, KvError> {
        Err(unavailable(key, "incr_by"))
    }

    async fn expire(&self, key: &str, _ttl: Duration) -> Result<bool, KvError> {
        Err(unavailable(key, "expire"))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        Err(unavailable(key, "ttl"))
    }

    async fn set_add(&self, key: &str, _member: &str) -> Result<(), KvError> {
        Err(unavailable(key, "set_add"))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        Err(unavailable(key, "set_members"))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        Err(unavailable(pattern, "scan"))
    }
}

#[tokio::test]
#[serial]
async fn failed_cache_lookups_fall_through_to_the_handler() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let app = Router::new()
        .route(
            "/report",
            get(move || {
                let calls = handler_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "fresh"
                }
            }),
        )
        .layer(middleware::from_fn_with_state(
            ResponseCacheState::new(
                Cache::new(Arc::new(UnreachableKv)),
                ResponseCacheConfig::default(),
            ),
            response_cache_layer,
        ));

    for _ in 0..2 {
        let request = Request::builder()
            .uri("/report")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should buffer");
        assert_eq!(&body[..], b"fresh");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let snapshot = snapshotter.snapshot().into_vec();
    let counter = |name: &str| {
        snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == name)
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(v) => DebugValue::Counter(*v),
                DebugValue::Gauge(v) => DebugValue::Gauge(*v),
                DebugValue::Histogram(v) => DebugValue::Histogram(v.clone()),
            })
    };
    // One failed lookup and one failed store per request.
    assert_eq!(
        counter(telemetry::METRIC_CACHE_BACKEND_ERROR),
        Some(DebugValue::Counter(4))
    );
    assert_eq!(
        counter(telemetry::METRIC_CACHE_MISS),
        Some(DebugValue::Counter(2))
    );
    assert_eq!(counter(telemetry::METRIC_CACHE_HIT), None);
}
