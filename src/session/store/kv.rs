use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use super::SessionStore;
use crate::infra::kv::KvBackend;
use crate::session::error::SessionError;
use crate::session::model::Session;

pub const DEFAULT_SESSION_PREFIX: &str = "session:";

/// Sessions kept in a networked key-value service.
///
/// Each session is a JSON document under `<prefix><id>` whose native expiry
/// matches the session's, so records disappear on their own and
/// [`SessionStore::sweep`] has nothing to do.
#[derive(Clone)]
pub struct KvSessionStore {
    backend: Arc<dyn KvBackend>,
    prefix: String,
}

impl KvSessionStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_prefix(backend, DEFAULT_SESSION_PREFIX)
    }

    pub fn with_prefix(backend: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.prefix)
    }

    /// Save with an explicit backend lifetime instead of the session's own expiry.
    pub async fn save_with_ttl(&self, session: &Session, ttl: Duration) -> Result<(), SessionError> {
        if ttl.is_zero() {
            return Err(SessionError::Expired);
        }
        let payload = serde_json::to_vec(session)?;
        self.backend
            .set(&self.key(session.id()), payload, Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> Result<bool, SessionError> {
        Ok(self.backend.exists(&self.key(id)).await?)
    }

    /// Number of stored sessions under this prefix.
    pub async fn count(&self) -> Result<usize, SessionError> {
        Ok(self.backend.scan(&format!("{}*", self.prefix)).await?.len())
    }

    /// Delete every session under this prefix, returning how many were removed.
    pub async fn clear(&self) -> Result<u64, SessionError> {
        let keys = self.backend.scan(&format!("{}*", self.prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.backend.delete(&keys).await?)
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn load(&self, cookie_value: &str) -> Result<Session, SessionError> {
        let key = self.key(cookie_value);
        let raw = self
            .backend
            .get(&key)
            .await?
            .ok_or(SessionError::NotFound)?;
        let session: Session = serde_json::from_slice(&raw)?;

        if session.is_expired() {
            // Cleanup only: the backend expiry removes the record anyway.
            if let Err(err) = self.backend.delete(&[key]).await {
                warn!(
                    session_id = %session.log_id(),
                    error = %err,
                    "failed to delete expired session"
                );
            }
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let remaining = session.expires_at() - OffsetDateTime::now_utc();
        if !remaining.is_positive() {
            return Err(SessionError::Expired);
        }
        let ttl = Duration::try_from(remaining).map_err(|_| SessionError::Expired)?;
        self.save_with_ttl(session, ttl).await
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.backend.delete(&[self.key(id)]).await?;
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<(), SessionError> {
        let mut session = self.load(id).await?;
        session.touch();
        self.save(&session).await
    }

    async fn sweep(&self) -> Result<usize, SessionError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::kv::{KeyTtl, KvError, MemoryKv};

    fn store() -> (Arc<MemoryKv>, KvSessionStore) {
        let backend = Arc::new(MemoryKv::new());
        let store = KvSessionStore::new(backend.clone());
        (backend, store)
    }

    #[tokio::test]
    async fn records_live_under_the_prefix() {
        let (backend, store) = store();
        let mut session = Session::new(Duration::from_secs(60));
        session.insert("user_id", 7);
        store.save(&session).await.expect("save");

        let key = format!("session:{}", session.id());
        assert!(backend.exists(&key).await.expect("exists"));
        let ttl = backend.ttl(&key).await.expect("ttl");
        assert!(ttl.remaining().is_some_and(|left| left <= Duration::from_secs(60)));

        assert_eq!(store.load(session.id()).await.expect("load"), session);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (_, store) = store();
        let err = store.load("absent").await.expect_err("missing");
        assert!(matches!(err, SessionError::NotFound));
    }

    #[tokio::test]
    async fn saving_an_expired_session_fails() {
        let (_, store) = store();
        let mut session = Session::new(Duration::from_secs(60));
        session.set_expires_at(session.created_at());

        let err = store.save(&session).await.expect_err("expired");
        assert!(matches!(err, SessionError::Expired));
        assert!(!store.exists(session.id()).await.expect("exists"));
    }

    #[tokio::test]
    async fn backend_expiry_removes_the_record() {
        let (_, store) = store();
        let session = Session::new(Duration::from_millis(30));
        store.save(&session).await.expect("save");

        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = store.load(session.id()).await.expect_err("gone");
        assert!(err.is_absent());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_serialization_error() {
        let (backend, store) = store();
        backend
            .set("session:broken", b"{not json".to_vec(), None)
            .await
            .expect("seed");
        let err = store.load("broken").await.expect_err("corrupt");
        assert!(matches!(err, SessionError::Serialization(_)));
    }

    #[tokio::test]
    async fn touch_resaves_and_rejects_unknown_ids() {
        let (_, store) = store();
        let mut session = Session::new(Duration::from_secs(60));
        session.insert("k", "v");
        store.save(&session).await.expect("save");

        store.touch(session.id()).await.expect("touch");
        let loaded = store.load(session.id()).await.expect("load");
        assert_eq!(loaded.data(), session.data());

        assert!(matches!(
            store.touch("unknown").await.expect_err("unknown"),
            SessionError::NotFound
        ));
    }

    #[tokio::test]
    async fn count_and_clear_only_see_this_prefix() {
        let (backend, store) = store();
        for _ in 0..3 {
            store
                .save(&Session::new(Duration::from_secs(60)))
                .await
                .expect("save");
        }
        backend
            .set("cache:other", b"1".to_vec(), None)
            .await
            .expect("seed");

        assert_eq!(store.count().await.expect("count"), 3);
        assert_eq!(store.clear().await.expect("clear"), 3);
        assert_eq!(store.count().await.expect("count"), 0);
        assert!(backend.exists("cache:other").await.expect("exists"));
        assert_eq!(store.clear().await.expect("clear again"), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_sweep_is_a_noop() {
        let (_, store) = store();
        let session = Session::new(Duration::from_secs(60));
        store.save(&session).await.expect("save");

        store.delete(session.id()).await.expect("delete");
        store.delete(session.id()).await.expect("delete again");
        assert!(!store.exists(session.id()).await.expect("exists"));
        assert_eq!(store.sweep().await.expect("sweep"), 0);
    }

    #[tokio::test]
    async fn save_with_ttl_overrides_lifetime() {
        let (backend, store) = store();
        let session = Session::new(Duration::from_secs(3600));
        store
            .save_with_ttl(&session, Duration::from_secs(5))
            .await
            .expect("save");

        let ttl = backend
            .ttl(&format!("session:{}", session.id()))
            .await
            .expect("ttl");
        assert!(ttl.remaining().is_some_and(|left| left <= Duration::from_secs(5)));
    }

    /// Memory backend whose deletes always fail.
    #[derive(Default)]
    struct NoDeleteKv {
        inner: MemoryKv,
    }

    #[async_trait]
    impl KvBackend for NoDeleteKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> Result<u64, KvError> {
            Err(KvError::WrongType {
                key: keys.join(","),
                op: "delete",
            })
        }

        async fn exists(&self, key: &str) -> Result<bool, KvError> {
            self.inner.exists(key).await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
            self.inner.incr_by(key, delta).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
            self.inner.expire(key, ttl).await
        }

        async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
            self.inner.ttl(key).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
            self.inner.set_add(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
            self.inner.set_members(key).await
        }

        async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
            self.inner.scan(pattern).await
        }
    }

    #[tokio::test]
    async fn expired_record_is_expired_even_when_cleanup_fails() {
        let backend = Arc::new(NoDeleteKv::default());
        let store = KvSessionStore::new(backend.clone());

        let mut session = Session::new(Duration::from_secs(60));
        session.set_expires_at(session.created_at());
        backend
            .set(
                &format!("session:{}", session.id()),
                serde_json::to_vec(&session).expect("serialize"),
                Some(Duration::from_secs(60)),
            )
            .await
            .expect("seed");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = store.load(session.id()).await.expect_err("expired");
        assert!(matches!(err, SessionError::Expired));
    }
}
