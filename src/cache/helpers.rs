use std::time::Duration;

use serde::Serialize;

use super::error::CacheError;
use super::middleware::CachedResponse;
use super::store::Cache;

/// Remove response-cache entries by key, e.g. `GET:/users` after a write.
pub async fn invalidate<K: AsRef<str>>(cache: &Cache, keys: &[K]) -> Result<u64, CacheError> {
    cache.delete_many(keys).await
}

/// Pre-populate `key` with a 200 `application/json` response for `value`.
///
/// The entry is replayed by the response cache exactly as if a handler had
/// produced it.
pub async fn cache_json<T: Serialize + ?Sized>(
    cache: &Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let body = serde_json::to_vec(value)?;
    cache.set(key, &CachedResponse::json(body), ttl).await
}
