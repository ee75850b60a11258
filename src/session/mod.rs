//! Cookie-addressed server sessions.
//!
//! - [`model`]: the [`Session`] entity and its [`Value`] payload.
//! - [`store`]: memory, cookie and key-value backends behind [`SessionStore`].
//! - [`middleware`]: the per-request resolve / persist lifecycle.
//! - [`handle`]: the [`SessionHandle`] handlers work with, plus flash helpers.
//! - [`sweeper`]: background removal of expired in-memory sessions.

pub mod config;
pub mod error;
pub mod handle;
pub mod middleware;
pub mod model;
pub mod store;
pub mod sweeper;

pub use config::{MAX_SESSION_AGE, SameSitePolicy, SessionConfig};
pub use error::SessionError;
pub use handle::{FLASH_PREFIX, SessionHandle, get_session};
pub use middleware::{ResolvedSession, SessionState, session_layer};
pub use model::{Session, Value};
pub use store::{CookieSessionStore, KvSessionStore, MemorySessionStore, SessionStore};
pub use sweeper::{MIN_SWEEP_INTERVAL, SweepTask};
