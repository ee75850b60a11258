//! Response cache configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};

use super::keys::{KeyFn, method_path_key};

pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Returns true for requests that must bypass the response cache.
pub type SkipFn = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ResponseCacheConfig {
    /// Lifetime of stored responses.
    pub ttl: Duration,
    /// Only responses with one of these statuses are stored.
    pub statuses: Vec<StatusCode>,
    pub key_fn: KeyFn,
    pub skip: Option<SkipFn>,
    /// Larger bodies are passed through without being stored.
    pub max_body_bytes: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_RESPONSE_TTL,
            statuses: vec![StatusCode::OK],
            key_fn: Arc::new(method_path_key),
            skip: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl fmt::Debug for ResponseCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCacheConfig")
            .field("ttl", &self.ttl)
            .field("statuses", &self.statuses)
            .field("skip", &self.skip.is_some())
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

impl ResponseCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn with_shared_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn should_store(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status)
    }

    pub fn should_skip(&self, request: &Request<Body>) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(request))
    }
}

impl From<&crate::config::CacheSettings> for ResponseCacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: settings.response_ttl,
            statuses: settings.statuses.clone(),
            max_body_bytes: settings.max_body_bytes,
            ..Self::default()
        }
    }
}
