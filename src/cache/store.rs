//! Key-value cache over a [`KvBackend`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::error::{CacheError, RememberError};
use super::tags::TaggedCache;
use crate::infra::kv::{KeyTtl, KvBackend};

pub const DEFAULT_CACHE_PREFIX: &str = "cache:";
pub const DEFAULT_TAG_PREFIX: &str = "tag:";

/// Prefixed key-value cache with TTLs, counters and tag indexes.
///
/// Cloning is cheap and clones share the backend and the single-flight table
/// used by [`Cache::remember`].
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Arc<dyn KvBackend>,
    prefix: String,
    tag_prefix: String,
    flights: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl Cache {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_prefixes(backend, DEFAULT_CACHE_PREFIX, DEFAULT_TAG_PREFIX)
    }

    pub fn with_prefixes(
        backend: Arc<dyn KvBackend>,
        prefix: impl Into<String>,
        tag_prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                prefix: prefix.into(),
                tag_prefix: tag_prefix.into(),
                flights: DashMap::new(),
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub(crate) fn backend(&self) -> &dyn KvBackend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.inner.prefix)
    }

    pub(crate) fn tag_key(&self, tag: &str) -> String {
        format!("{}{tag}", self.inner.tag_prefix)
    }

    /// Deserialize the JSON stored under `key`. A miss is `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get_bytes(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.backend().get(&self.full_key(key)).await?)
    }

    /// Raw value as text; invalid UTF-8 is replaced rather than rejected.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .get_bytes(key)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Store `value` as JSON for `ttl`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(value)?;
        self.set_bytes(key, payload, ttl).await
    }

    pub async fn set_bytes(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        self.backend()
            .set(&self.full_key(key), value.into(), Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.set_bytes(key, value.as_bytes(), ttl).await
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.delete_many(&[key]).await? > 0)
    }

    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let full: Vec<String> = keys.iter().map(|key| self.full_key(key.as_ref())).collect();
        Ok(self.backend().delete(&full).await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.backend().exists(&self.full_key(key)).await?)
    }

    /// Delete every entry under this cache's prefix.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        self.delete_full(format!("{}*", self.inner.prefix)).await
    }

    /// Delete entries whose unprefixed key matches `pattern` (`*`, `?`).
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let removed = self.delete_full(self.full_key(pattern)).await?;
        debug!(cache = "kv", pattern, removed, "invalidated by pattern");
        Ok(removed)
    }

    async fn delete_full(&self, full_pattern: String) -> Result<u64, CacheError> {
        let keys = self.backend().scan(&full_pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.backend().delete(&keys).await?)
    }

    pub async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.increment_by(key, 1).await
    }

    pub async fn decrement(&self, key: &str) -> Result<i64, CacheError> {
        self.increment_by(key, -1).await
    }

    /// Atomically add `delta`; an absent counter starts at zero.
    pub async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        Ok(self.backend().incr_by(&self.full_key(key), delta).await?)
    }

    /// Arm an expiry on an existing entry. Returns false when the key is absent.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        Ok(self.backend().expire(&self.full_key(key), ttl).await?)
    }

    pub async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl, CacheError> {
        Ok(self.backend().ttl(&self.full_key(key)).await?)
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// Concurrent callers in this process that miss on the same key wait for
    /// a single computation. A failed computation stores nothing.
    pub async fn remember<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, RememberError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.remember_into(None, key, ttl, compute).await
    }

    pub(crate) async fn remember_into<T, E, F, Fut>(
        &self,
        tagged: Option<&TaggedCache>,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, RememberError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl.into());
        }
        if let Some(hit) = self.get::<T>(key).await? {
            debug!(cache = "kv", outcome = "hit", "remember");
            return Ok(hit);
        }

        // Declared before `slot` so it drops after it, on return or cancellation.
        let _cleanup = FlightCleanup {
            flights: &self.inner.flights,
            key,
        };
        let slot = self
            .inner
            .flights
            .entry(key.to_string())
            .or_default()
            .clone();
        let _turn = slot.lock().await;
        self.remember_locked(tagged, key, ttl, compute).await
    }

    async fn remember_locked<T, E, F, Fut>(
        &self,
        tagged: Option<&TaggedCache>,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, RememberError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await? {
            debug!(cache = "kv", outcome = "hit_after_wait", "remember");
            return Ok(hit);
        }

        debug!(cache = "kv", outcome = "miss", "remember computing value");
        let value = compute().await.map_err(RememberError::Compute)?;
        match tagged {
            Some(tagged) => tagged.set(key, &value, ttl).await?,
            None => self.set(key, &value, ttl).await?,
        }
        Ok(value)
    }

    /// Scope writes and flushes to the given tags.
    pub fn tags<S: AsRef<str>>(&self, tags: &[S]) -> TaggedCache {
        TaggedCache::new(
            self.clone(),
            tags.iter().map(|tag| tag.as_ref().to_string()).collect(),
        )
    }
}

/// Removes a key's single-flight slot once no caller holds it.
struct FlightCleanup<'a> {
    flights: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    key: &'a str,
}

impl Drop for FlightCleanup<'_> {
    fn drop(&mut self) {
        // The map holds the only remaining reference once no caller waits on it.
        self.flights
            .remove_if(self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::infra::kv::MemoryKv;

    fn cache() -> (Arc<MemoryKv>, Cache) {
        let backend = Arc::new(MemoryKv::new());
        (backend.clone(), Cache::new(backend))
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn typed_roundtrip_under_prefix() {
        let (backend, cache) = cache();
        let user = User {
            id: 1,
            name: "Ada".to_string(),
        };
        cache
            .set("user:1", &user, Duration::from_secs(60))
            .await
            .expect("set");

        assert!(backend.exists("cache:user:1").await.expect("exists"));
        let loaded: Option<User> = cache.get("user:1").await.expect("get");
        assert_eq!(loaded, Some(user));
    }

    #[tokio::test]
    async fn miss_is_none() {
        let (_, cache) = cache();
        let missing: Option<User> = cache.get("nobody").await.expect("get");
        assert!(missing.is_none());
        assert!(cache.get_string("nobody").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let (_, cache) = cache();
        let err = cache
            .set_string("k", "v", Duration::ZERO)
            .await
            .expect_err("zero ttl");
        assert!(matches!(err, CacheError::InvalidTtl));
        assert!(!cache.exists("k").await.expect("exists"));
    }

    #[tokio::test]
    async fn strings_and_bytes() {
        let (_, cache) = cache();
        cache
            .set_string("greeting", "hello", Duration::from_secs(60))
            .await
            .expect("set");
        cache
            .set_bytes("blob", vec![0_u8, 1, 2], Duration::from_secs(60))
            .await
            .expect("set");

        assert_eq!(
            cache.get_string("greeting").await.expect("get").as_deref(),
            Some("hello")
        );
        assert_eq!(
            cache.get_bytes("blob").await.expect("get"),
            Some(vec![0_u8, 1, 2])
        );
    }

    #[tokio::test]
    async fn counters_start_at_zero() {
        let (_, cache) = cache();
        assert_eq!(cache.increment("c").await.expect("incr"), 1);
        assert_eq!(cache.increment("c").await.expect("incr"), 2);
        assert_eq!(cache.increment_by("c", 10).await.expect("incr"), 12);
        assert_eq!(cache.decrement("c").await.expect("decr"), 11);
        assert_eq!(cache.decrement("fresh").await.expect("decr"), -1);
    }

    #[tokio::test]
    async fn expire_and_ttl_remaining() {
        let (_, cache) = cache();
        assert_eq!(
            cache.ttl_remaining("absent").await.expect("ttl"),
            KeyTtl::Missing
        );
        assert!(!cache
            .expire("absent", Duration::from_secs(5))
            .await
            .expect("expire"));

        cache.increment("counter").await.expect("incr");
        assert_eq!(
            cache.ttl_remaining("counter").await.expect("ttl"),
            KeyTtl::Persistent
        );
        assert!(cache
            .expire("counter", Duration::from_secs(5))
            .await
            .expect("expire"));
        let left = cache
            .ttl_remaining("counter")
            .await
            .expect("ttl")
            .remaining()
            .expect("expiring");
        assert!(left <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_, cache) = cache();
        cache
            .set_string("a", "1", Duration::from_secs(60))
            .await
            .expect("set");
        assert!(cache.delete("a").await.expect("delete"));
        assert!(!cache.delete("a").await.expect("delete again"));
        assert_eq!(cache.delete_many::<&str>(&[]).await.expect("empty"), 0);
    }

    #[tokio::test]
    async fn clear_and_pattern_stay_inside_the_prefix() {
        let (backend, cache) = cache();
        for key in ["user:1", "user:2", "post:1"] {
            cache
                .set_string(key, "x", Duration::from_secs(60))
                .await
                .expect("set");
        }
        backend
            .set("session:abc", b"{}".to_vec(), None)
            .await
            .expect("seed");

        assert_eq!(cache.invalidate_pattern("user:*").await.expect("pattern"), 2);
        assert!(cache.exists("post:1").await.expect("exists"));
        assert_eq!(cache.clear().await.expect("clear"), 1);
        assert!(backend.exists("session:abc").await.expect("exists"));
    }

    #[tokio::test]
    async fn remember_computes_once_then_hits() {
        let (_, cache) = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u64 = cache
                .remember("answer", Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(42)
                })
                .await
                .expect("remember");
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remember_failure_caches_nothing() {
        let (_, cache) = cache();
        let err = cache
            .remember("flaky", Duration::from_secs(60), || async {
                Err::<u64, _>("upstream down")
            })
            .await
            .expect_err("compute fails");
        assert!(matches!(err, RememberError::Compute("upstream down")));
        assert!(!cache.exists("flaky").await.expect("exists"));
    }

    #[tokio::test]
    async fn remember_is_single_flight() {
        let (_, cache) = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .remember("slow", Duration::from_secs(60), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, std::io::Error>("computed".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let value = task.await.expect("join").expect("remember");
            assert_eq!(value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.inner.flights.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiters_leave_no_flight_behind() {
        let (_, cache) = cache();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .remember("held", Duration::from_secs(60), || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, std::io::Error>(1_u32)
                    })
                    .await
            })
        };
        started_rx.await.expect("leader computing");

        // A waiter parks on the lock, then is dropped before acquiring it.
        let waiter = cache.remember("held", Duration::from_secs(60), || async {
            Ok::<_, std::io::Error>(2_u32)
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(20), waiter)
                .await
                .is_err()
        );
        assert_eq!(cache.inner.flights.len(), 1);

        release_tx.send(()).expect("leader waiting");
        assert_eq!(leader.await.expect("join").expect("remember"), 1);
        assert!(cache.inner.flights.is_empty());
    }

    #[tokio::test]
    async fn cancelled_leader_releases_its_flight() {
        let (_, cache) = cache();
        let leader = cache.remember("stuck", Duration::from_secs(60), || async {
            std::future::pending::<Result<u32, std::io::Error>>().await
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(20), leader)
                .await
                .is_err()
        );
        assert!(cache.inner.flights.is_empty());
    }
}
