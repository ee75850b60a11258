//! Key-value cache and HTTP response cache.
//!
//! - [`Cache`]: prefixed values with TTLs, atomic counters, single-flight
//!   [`Cache::remember`] and tag-indexed invalidation through [`TaggedCache`].
//! - [`response_cache_layer`]: replays stored GET/HEAD responses.
//! - [`FixedWindowLimiter`]: request counting on top of [`Cache::increment`].
//!
//! Everything is stored through a [`crate::infra::kv::KvBackend`], so one
//! Redis deployment can serve several application instances.

mod config;
mod error;
mod helpers;
mod keys;
mod middleware;
mod rate_limit;
mod store;
mod tags;

pub use config::{DEFAULT_MAX_BODY_BYTES, DEFAULT_RESPONSE_TTL, ResponseCacheConfig, SkipFn};
pub use error::{CacheError, RememberError};
pub use helpers::{cache_json, invalidate};
pub use keys::{KeyFn, hashed_key, method_path_key, params_key, query_key};
pub use middleware::{CachedHeader, CachedResponse, ResponseCacheState, response_cache_layer};
pub use rate_limit::{FixedWindowLimiter, RateDecision};
pub use store::{Cache, DEFAULT_CACHE_PREFIX, DEFAULT_TAG_PREFIX};
pub use tags::TaggedCache;
