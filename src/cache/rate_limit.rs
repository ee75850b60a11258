use std::time::Duration;

use super::error::CacheError;
use super::store::Cache;

/// Fixed-window request counter stored in a [`Cache`].
///
/// The first hit in a window creates the counter and arms its expiry, so
/// every instance sharing the backend sees the same window.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    cache: Cache,
    window: Duration,
    max_requests: u32,
}

/// Outcome of [`FixedWindowLimiter::allow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

impl FixedWindowLimiter {
    pub fn new(cache: Cache, window: Duration, max_requests: u32) -> Self {
        Self {
            cache,
            window,
            max_requests,
        }
    }

    /// Count one request for `key` on `route` and decide whether it may proceed.
    pub async fn allow(&self, key: &str, route: &str) -> Result<RateDecision, CacheError> {
        let counter_key = format!("ratelimit:{key}:{route}");
        let count = self.cache.increment(&counter_key).await?;
        if count == 1 {
            self.cache.expire(&counter_key, self.window).await?;
        }

        let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        Ok(RateDecision {
            allowed: count <= self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
        })
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }
}
