use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use super::SessionStore;
use crate::infra::lock::{rw_read, rw_write};
use crate::session::error::SessionError;
use crate::session::model::Session;

const SOURCE: &str = "session::store::memory";

/// Process-local session table.
///
/// Records are lost on restart and are not shared between instances. Expired
/// records are dropped when loaded and by [`SessionStore::sweep`], which is
/// normally driven by a [`crate::session::SweepTask`].
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.sessions, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.sessions, SOURCE, "clear").clear();
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, cookie_value: &str) -> Result<Session, SessionError> {
        let now = OffsetDateTime::now_utc();
        {
            let sessions = rw_read(&self.sessions, SOURCE, "load");
            match sessions.get(cookie_value) {
                None => return Err(SessionError::NotFound),
                Some(session) if !session.is_expired_at(now) => return Ok(session.clone()),
                Some(_) => {}
            }
        }

        let mut sessions = rw_write(&self.sessions, SOURCE, "load_expired");
        if sessions
            .get(cookie_value)
            .is_some_and(|session| session.is_expired_at(now))
        {
            sessions.remove(cookie_value);
        }
        Err(SessionError::Expired)
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        rw_write(&self.sessions, SOURCE, "save").insert(session.id().to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        rw_write(&self.sessions, SOURCE, "delete").remove(id);
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = rw_write(&self.sessions, SOURCE, "touch");
        let session = sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        session.touch();
        Ok(())
    }

    async fn sweep(&self) -> Result<usize, SessionError> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = rw_write(&self.sessions, SOURCE, "sweep");
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired_at(now));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(store = "memory", removed, "swept expired sessions");
        }
        Ok(removed)
    }
}
