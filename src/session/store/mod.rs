//! Session persistence backends.
//!
//! Every backend implements [`SessionStore`]; the middleware holds an
//! `Arc<dyn SessionStore>` chosen at construction.

mod cookie;
mod kv;
mod memory;

use async_trait::async_trait;

pub use cookie::CookieSessionStore;
pub use kv::{DEFAULT_SESSION_PREFIX, KvSessionStore};
pub use memory::MemorySessionStore;

use super::error::SessionError;
use super::model::Session;

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Resolve the value carried by the session cookie into a session.
    ///
    /// Absent records yield [`SessionError::NotFound`]; records past their
    /// expiry yield [`SessionError::Expired`].
    async fn load(&self, cookie_value: &str) -> Result<Session, SessionError>;

    /// Insert or replace the record for `session.id()`.
    async fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// Remove a record. Deleting an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<(), SessionError>;

    /// Record an access on an existing session without changing its payload.
    async fn touch(&self, id: &str) -> Result<(), SessionError>;

    /// Remove expired records, returning how many were dropped.
    async fn sweep(&self) -> Result<usize, SessionError>;

    /// Value written into the outgoing session cookie.
    fn cookie_value(&self, session: &Session) -> Result<String, SessionError> {
        Ok(session.id().to_string())
    }
}
