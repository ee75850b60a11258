//! Cache key derivation for the response cache.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{body::Body, extract::Query, http::Request};
use sha2::{Digest, Sha256};

/// Derives the cache key for a request.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// `METHOD:path`. Requests differing only in their query share an entry.
pub fn method_path_key(request: &Request<Body>) -> String {
    format!("{}:{}", request.method(), request.uri().path())
}

/// `METHOD:path?query`, or `METHOD:path` when there is no query.
pub fn query_key(request: &Request<Body>) -> String {
    match request.uri().query() {
        Some(query) if !query.is_empty() => {
            format!("{}:{}?{query}", request.method(), request.uri().path())
        }
        _ => method_path_key(request),
    }
}

/// Hex SHA-256 of `METHOD:path:query`; fixed length whatever the URI.
pub fn hashed_key(request: &Request<Body>) -> String {
    let material = format!(
        "{}:{}:{}",
        request.method(),
        request.uri().path(),
        request.uri().query().unwrap_or("")
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// `METHOD:path:v1:v2…` with the values of the named query parameters, in
/// the order given. Missing parameters contribute an empty segment.
pub fn params_key<I, S>(params: I) -> KeyFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let params: Vec<String> = params.into_iter().map(Into::into).collect();
    Arc::new(move |request: &Request<Body>| {
        let query: HashMap<String, String> = Query::try_from_uri(request.uri())
            .map(|Query(values)| values)
            .unwrap_or_default();
        let mut key = method_path_key(request);
        for param in &params {
            key.push(':');
            key.push_str(query.get(param).map(String::as_str).unwrap_or(""));
        }
        key
    })
}
