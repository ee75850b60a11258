use std::future::Future;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use super::error::{CacheError, RememberError};
use super::store::Cache;

/// A [`Cache`] view whose writes are indexed under one or more tags.
///
/// Each tag is a set at `<tag-prefix><tag>` holding unprefixed cache keys.
/// The index and the values are not updated atomically: an index entry whose
/// value already expired is simply skipped at flush time.
#[derive(Clone)]
pub struct TaggedCache {
    cache: Cache,
    tags: Vec<String>,
}

impl TaggedCache {
    pub(crate) fn new(cache: Cache, tags: Vec<String>) -> Self {
        Self { cache, tags }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Store `value` and record `key` under every tag.
    ///
    /// Each tag index is given the same ttl, so an index never outlives the
    /// most recent entry written through it.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.cache.set(key, value, ttl).await?;
        self.index(key, ttl).await
    }

    pub async fn set_bytes(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.cache.set_bytes(key, value, ttl).await?;
        self.index(key, ttl).await
    }

    /// [`Cache::remember`] whose computed value is indexed under these tags.
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
        self.cache.remember_into(Some(self), key, ttl, compute).await
    }

    async fn index(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let backend = self.cache.backend();
        for tag in &self.tags {
            let tag_key = self.cache.tag_key(tag);
            backend.set_add(&tag_key, key).await?;
            backend.expire(&tag_key, ttl).await?;
        }
        Ok(())
    }

    /// Delete every entry indexed under these tags, then the indexes.
    ///
    /// Returns how many cache entries were removed. Flushing again is a no-op.
    pub async fn flush(&self) -> Result<u64, CacheError> {
        let backend = self.cache.backend();
        let mut removed = 0;
        for tag in &self.tags {
            let tag_key = self.cache.tag_key(tag);
            let members = backend.set_members(&tag_key).await?;
            if !members.is_empty() {
                let keys: Vec<String> = members
                    .iter()
                    .map(|member| self.cache.full_key(member))
                    .collect();
                removed += backend.delete(&keys).await?;
            }
            backend.delete(&[tag_key]).await?;
            debug!(cache = "kv", tag = %tag, members = members.len(), "flushed tag");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::infra::kv::{KeyTtl, KvBackend, MemoryKv};

    fn cache() -> (Arc<MemoryKv>, Cache) {
        let backend = Arc::new(MemoryKv::new());
        (backend.clone(), Cache::new(backend))
    }

    #[tokio::test]
    async fn tagged_set_then_flush_misses() {
        let (_, cache) = cache();
        let tagged = cache.tags(&["products"]);
        tagged
            .set("product:1", &"widget", Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(
            cache.get::<String>("product:1").await.expect("get").as_deref(),
            Some("widget")
        );

        assert_eq!(tagged.flush().await.expect("flush"), 1);
        assert!(cache.get::<String>("product:1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let (backend, cache) = cache();
        let tagged = cache.tags(&["a"]);
        tagged
            .set("k", &1, Duration::from_secs(60))
            .await
            .expect("set");

        assert_eq!(tagged.flush().await.expect("first"), 1);
        assert_eq!(tagged.flush().await.expect("second"), 0);
        assert!(!backend.exists("tag:a").await.expect("exists"));
    }

    #[tokio::test]
    async fn keys_can_belong_to_several_tags() {
        let (backend, cache) = cache();
        cache
            .tags(&["products", "catalog"])
            .set("product:1", &"widget", Duration::from_secs(60))
            .await
            .expect("set");
        cache
            .tags(&["catalog"])
            .set("category:tools", &"tools", Duration::from_secs(60))
            .await
            .expect("set");

        let members = backend.set_members("tag:catalog").await.expect("members");
        assert_eq!(members.len(), 2);

        assert_eq!(cache.tags(&["catalog"]).flush().await.expect("flush"), 2);
        assert!(!cache.exists("product:1").await.expect("exists"));
        // The other index still points at the deleted key; flushing it is harmless.
        assert_eq!(cache.tags(&["products"]).flush().await.expect("flush"), 0);
    }

    #[tokio::test]
    async fn tag_index_expires_with_its_entries() {
        let (backend, cache) = cache();
        cache
            .tags(&["short"])
            .set("k", &true, Duration::from_secs(30))
            .await
            .expect("set");

        let ttl = backend.ttl("tag:short").await.expect("ttl");
        assert!(matches!(ttl, KeyTtl::Expires(left) if left <= Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn remembered_values_are_flushed_with_their_tags() {
        let (_, cache) = cache();
        let tagged = cache.tags(&["products"]);
        let value: String = tagged
            .remember("product:7", Duration::from_secs(60), || async {
                Ok::<_, std::convert::Infallible>("gadget".to_string())
            })
            .await
            .expect("remember");
        assert_eq!(value, "gadget");

        assert_eq!(tagged.flush().await.expect("flush"), 1);
        assert!(!cache.exists("product:7").await.expect("exists"));
    }
}
