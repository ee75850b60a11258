//! Request-scoped access to the active session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use axum::extract::FromRequestParts;
use axum::http::{Extensions, request::Parts};
use tracing::{debug, warn};

use super::config::{DEFAULT_CONTEXT_KEY, SessionConfig};
use super::error::SessionError;
use super::model::{Session, Value};
use super::store::SessionStore;
use crate::error::AppError;
use crate::infra::lock::mutex_lock;

const SOURCE: &str = "session::handle";

/// Key prefix reserved for flash entries.
pub const FLASH_PREFIX: &str = "_flash_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Destroyed,
}

struct HandleState {
    session: Session,
    status: Status,
}

/// Working copy of the current session, shared by every clone.
///
/// Mutations stay in memory until the session middleware persists them after
/// the handler returns. [`SessionHandle::destroy`] and
/// [`SessionHandle::regenerate`] reach the store immediately.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<Mutex<HandleState>>,
    store: Arc<dyn SessionStore>,
    config: Arc<SessionConfig>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = mutex_lock(&self.state, SOURCE, "debug");
        f.debug_struct("SessionHandle")
            .field("session_id", &state.session.log_id())
            .field("status", &state.status)
            .field("keys", &state.session.len())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        session: Session,
        store: Arc<dyn SessionStore>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(HandleState {
                session,
                status: Status::Active,
            })),
            store,
            config,
        }
    }

    pub fn id(&self) -> String {
        mutex_lock(&self.state, SOURCE, "id").session.id().to_string()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        mutex_lock(&self.state, SOURCE, "get")
            .session
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        mutex_lock(&self.state, SOURCE, "insert")
            .session
            .insert(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        mutex_lock(&self.state, SOURCE, "remove").session.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        mutex_lock(&self.state, SOURCE, "contains_key")
            .session
            .contains_key(key)
    }

    /// Drop every value while keeping the identifier.
    pub fn clear(&self) {
        mutex_lock(&self.state, SOURCE, "clear").session.clear();
    }

    /// Copy of the session as it currently stands.
    pub fn snapshot(&self) -> Session {
        mutex_lock(&self.state, SOURCE, "snapshot").session.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_destroyed").status == Status::Destroyed
    }

    /// Store a value that the next [`SessionHandle::get_flash`] consumes.
    pub fn set_flash(&self, key: &str, value: impl Into<Value>) {
        self.insert(format!("{FLASH_PREFIX}{key}"), value);
    }

    /// Read and remove a flash value. At most one read ever observes it.
    pub fn get_flash(&self, key: &str) -> Option<Value> {
        mutex_lock(&self.state, SOURCE, "get_flash")
            .session
            .remove(&format!("{FLASH_PREFIX}{key}"))
    }

    /// Delete the session from the store and expire the client's cookie.
    ///
    /// The handle is marked destroyed even when the store delete fails, so the
    /// middleware never writes the session back.
    pub async fn destroy(&self) -> Result<(), SessionError> {
        let id = {
            let mut state = mutex_lock(&self.state, SOURCE, "destroy");
            state.status = Status::Destroyed;
            state.session.id().to_string()
        };
        self.store.delete(&id).await?;
        debug!(session_id = %super::model::log_id(&id), "session destroyed");
        Ok(())
    }

    /// Move the current data under a fresh identifier.
    ///
    /// The new session is saved before the old one is deleted, so a failure
    /// leaves the client with a working session. Failing to delete the old
    /// record is only logged.
    pub async fn regenerate(&self) -> Result<(), SessionError> {
        let (old_id, data) = {
            let state = mutex_lock(&self.state, SOURCE, "regenerate.snapshot");
            (state.session.id().to_string(), state.session.data().clone())
        };

        let fresh = Session::with_data(data, self.config.max_age);
        self.store.save(&fresh).await?;

        if let Err(err) = self.store.delete(&old_id).await {
            warn!(
                session_id = %super::model::log_id(&old_id),
                error = %err,
                "failed to delete session replaced by regenerate"
            );
        }

        debug!(
            old_session_id = %super::model::log_id(&old_id),
            session_id = %fresh.log_id(),
            "session regenerated"
        );

        let mut state = mutex_lock(&self.state, SOURCE, "regenerate.swap");
        state.session = fresh;
        state.status = Status::Active;
        Ok(())
    }

    /// Refresh the expiry and hand back the session to persist, or `None`
    /// when the handle was destroyed.
    pub(crate) fn prepare_persist(&self) -> Option<Session> {
        let mut state = mutex_lock(&self.state, SOURCE, "prepare_persist");
        if state.status == Status::Destroyed {
            return None;
        }
        state.session.refresh_expiry(self.config.max_age);
        Some(state.session.clone())
    }
}

/// Session handles attached to a request, one per context key.
#[derive(Clone, Default)]
pub(crate) struct SessionSlots(HashMap<String, SessionHandle>);

impl SessionSlots {
    pub(crate) fn attach(extensions: &mut Extensions, key: &str, handle: SessionHandle) {
        let mut slots = extensions.remove::<SessionSlots>().unwrap_or_default();
        slots.0.insert(key.to_string(), handle);
        extensions.insert(slots);
    }

    fn get(&self, key: &str) -> Option<&SessionHandle> {
        self.0.get(key)
    }

    fn only(&self) -> Option<&SessionHandle> {
        if self.0.len() == 1 {
            self.0.values().next()
        } else {
            None
        }
    }
}

/// Look up the session handle attached under `context_key`.
pub fn get_session(extensions: &Extensions, context_key: &str) -> Result<SessionHandle, SessionError> {
    extensions
        .get::<SessionSlots>()
        .and_then(|slots| slots.get(context_key))
        .cloned()
        .ok_or(SessionError::NotFound)
}

/// Extracts the session under the default context key, or the only session
/// attached when a single layer with a custom key is installed.
impl<S> FromRequestParts<S> for SessionHandle
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let slots = parts
            .extensions
            .get::<SessionSlots>()
            .ok_or(AppError::Session(SessionError::NotFound))?;
        slots
            .get(DEFAULT_CONTEXT_KEY)
            .or_else(|| slots.only())
            .cloned()
            .ok_or(AppError::Session(SessionError::NotFound))
    }
}
