use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, Request, header::RETRY_AFTER},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{info, warn};

use super::middleware::{log_responses, set_request_context};
use crate::{
    cache::{Cache, FixedWindowLimiter, ResponseCacheState, response_cache_layer},
    error::AppError,
    session::{SessionHandle, SessionState, session_layer},
};

const PRODUCT_TTL: Duration = Duration::from_secs(10 * 60);
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Bucket shared by requests whose peer address is unknown.
const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Clone)]
pub struct HttpState {
    pub sessions: SessionState,
    pub cache: Cache,
    pub response_cache: ResponseCacheState,
    pub limiter: FixedWindowLimiter,
    pub catalog: Arc<DashMap<u32, Product>>,
}

impl HttpState {
    pub fn new(
        sessions: SessionState,
        cache: Cache,
        response_cache: ResponseCacheState,
        limiter: FixedWindowLimiter,
    ) -> Self {
        Self {
            sessions,
            cache,
            response_cache,
            limiter,
            catalog: Arc::new(DashMap::new()),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    let cached_routes = Router::new()
        .route("/users", get(list_users))
        .layer(middleware::from_fn_with_state(
            state.response_cache.clone(),
            response_cache_layer,
        ));

    Router::new()
        .route("/", get(index))
        .route("/login", post(login))
        .route("/profile", get(profile))
        .route("/logout", post(logout))
        .route("/counter", get(counter))
        .route("/submit", post(submit))
        .route("/result", get(result))
        .route("/regenerate", post(regenerate))
        .route("/products/{id}", get(show_product).post(update_product))
        .merge(cached_routes)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.sessions.clone(),
            session_layer,
        ))
        .layer(middleware::from_fn_with_state(state.limiter.clone(), rate_limit))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

/// Fixed-window limit per client address and path.
///
/// The client is the peer address from [`ConnectInfo`], so serve the router
/// with `into_make_service_with_connect_info::<SocketAddr>()`. Requests
/// without one share a single bucket. Session cookies and forwarding headers
/// are client-controlled and never pick the bucket. Runs outside the session
/// layer, so a rejected request creates no session. A backend failure lets
/// the request through.
pub async fn rate_limit(
    State(limiter): State<FixedWindowLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let client = client_key(&request);

    match limiter.allow(&client, &path).await {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limiter.limit()));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
            response
        }
        Ok(_) => {
            warn!(
                target = "larder::http::ratelimit",
                client = %client,
                path = %path,
                "rate limit exceeded"
            );
            let mut response = AppError::RateLimited.into_response();
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(limiter.retry_after_secs()));
            response
        }
        Err(err) => {
            warn!(
                target = "larder::http::ratelimit",
                error = %err,
                "rate limiter unavailable; allowing request"
            );
            next.run(request).await
        }
    }
}

fn client_key(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

async fn index() -> Json<JsonValue> {
    Json(json!({
        "message": "larder sessions and response cache",
        "endpoints": {
            "login": "POST /login",
            "profile": "GET /profile",
            "logout": "POST /logout",
            "counter": "GET /counter",
            "submit": "POST /submit",
            "result": "GET /result",
            "regenerate": "POST /regenerate",
            "users": "GET /users (cached)",
            "products": "GET /products/{id} (cached), POST /products/{id} (invalidates)",
        },
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login(
    session: SessionHandle,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<JsonValue>, AppError> {
    let credentials = body(payload)?;
    if credentials.username.trim().is_empty() || credentials.password.is_empty() {
        return Err(AppError::validation("username and password are required"));
    }

    // Fresh identifier on privilege change.
    session.regenerate().await?;
    session.insert("user_id", format!("user-{}", credentials.username));
    session.insert("username", credentials.username.clone());
    session.insert("logged_in", true);
    session.insert("login_time", rfc3339(OffsetDateTime::now_utc()));

    info!(target = "larder::http::session", "user logged in");

    Ok(Json(json!({
        "message": "Login successful",
        "username": credentials.username,
        "session_id": session.id(),
    })))
}

async fn profile(session: SessionHandle) -> Result<Json<JsonValue>, AppError> {
    let logged_in = session
        .get("logged_in")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    if !logged_in {
        return Err(AppError::Unauthorized);
    }

    let snapshot = session.snapshot();
    let field = |key: &str| {
        snapshot
            .get(key)
            .and_then(|value| value.as_str())
            .map(str::to_string)
    };

    Ok(Json(json!({
        "user_id": field("user_id"),
        "username": field("username"),
        "login_time": field("login_time"),
        "session_id": snapshot.id(),
        "created_at": rfc3339(snapshot.created_at()),
        "expires_at": rfc3339(snapshot.expires_at()),
    })))
}

async fn logout(session: SessionHandle) -> Result<Json<JsonValue>, AppError> {
    session.destroy().await?;
    Ok(Json(json!({ "message": "Logged out" })))
}

async fn counter(session: SessionHandle) -> Json<JsonValue> {
    let next = session
        .get("counter")
        .and_then(|value| value.as_i64())
        .unwrap_or(0)
        + 1;
    session.insert("counter", next);

    Json(json!({
        "counter": next,
        "session_id": session.id(),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    data: String,
}

async fn submit(
    session: SessionHandle,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<JsonValue>, AppError> {
    let input = body(payload)?;
    session.set_flash("success", "Data submitted successfully!");
    session.set_flash("data", input.data);

    Ok(Json(json!({
        "message": "Data submitted. Check /result for the flash message",
    })))
}

async fn result(session: SessionHandle) -> Json<JsonValue> {
    let success = session.get_flash("success");
    let data = session.get_flash("data");

    match success.as_ref().and_then(|value| value.as_str()) {
        Some(message) => Json(json!({
            "flash_message": message,
            "data": data.as_ref().and_then(|value| value.as_str()),
        })),
        None => Json(json!({
            "message": "No flash messages. Submit data first at POST /submit",
        })),
    }
}

async fn regenerate(session: SessionHandle) -> Result<Json<JsonValue>, AppError> {
    session.regenerate().await?;
    Ok(Json(json!({
        "message": "Session regenerated",
        "session_id": session.id(),
    })))
}

async fn list_users() -> Json<JsonValue> {
    Json(json!({
        "users": [
            { "id": 1, "name": "Alice", "email": "alice@example.com" },
            { "id": 2, "name": "Bob", "email": "bob@example.com" },
            { "id": 3, "name": "Charlie", "email": "charlie@example.com" },
        ],
        "cached_at": rfc3339(OffsetDateTime::now_utc()),
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u32,
    pub name: String,
    pub price: f64,
    pub description: String,
    pub loaded_at: String,
}

fn load_product(catalog: &DashMap<u32, Product>, id: u32) -> Result<Product, AppError> {
    if id == 0 {
        return Err(AppError::NotFound);
    }
    let mut product = catalog
        .get(&id)
        .map(|entry| entry.value().clone()).unwrap_or_else(|| Product {
        id,
        name: format!("Product {id}"),
        price: 99.99,
        description: "This is a sample product".to_string(),
        loaded_at: String::new(),
    });
    product.loaded_at = rfc3339(OffsetDateTime::now_utc());
    Ok(product)
}

async fn show_product(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
) -> Result<Json<Product>, AppError> {
    let product_tag = format!("product:{id}");
    let catalog = state.catalog.clone();
    let product = state
        .cache
        .tags(&["products", product_tag.as_str()])
        .remember(&product_tag, PRODUCT_TTL, || async move {
            load_product(&catalog, id)
        })
        .await?;
    Ok(Json(product))
}

#[derive(Debug, Deserialize)]
struct ProductUpdate {
    name: Option<String>,
    price: Option<f64>,
    description: Option<String>,
}

async fn update_product(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
    payload: Result<Json<ProductUpdate>, JsonRejection>,
) -> Result<Json<JsonValue>, AppError> {
    let update = body(payload)?;
    if update.price.is_some_and(|price| !price.is_finite() || price < 0.0) {
        return Err(AppError::validation("price must be a non-negative number"));
    }

    let mut product = load_product(&state.catalog, id)?;
    if let Some(name) = update.name {
        product.name = name;
    }
    if let Some(price) = update.price {
        product.price = price;
    }
    if let Some(description) = update.description {
        product.description = description;
    }
    state.catalog.insert(id, product);

    let product_tag = format!("product:{id}");
    let removed = state.cache.tags(&[product_tag.as_str()]).flush().await?;

    Ok(Json(json!({
        "message": "Product updated",
        "cache_cleared": removed > 0,
    })))
}
