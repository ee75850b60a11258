//! Session middleware.
//!
//! Resolves the session named by the request cookie (or starts a new one),
//! exposes it to the handler through a [`SessionHandle`], then persists it and
//! re-issues the cookie once the handler has produced a response.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use metrics::counter;
use tracing::{debug, error, instrument, warn};

use super::config::SessionConfig;
use super::error::SessionError;
use super::handle::{SessionHandle, SessionSlots};
use super::model::{Session, log_id};
use super::store::SessionStore;
use crate::error::AppError;
use crate::infra::telemetry::{
    METRIC_SESSION_CREATED, METRIC_SESSION_PERSIST_ERROR, METRIC_SESSION_RESOLVED,
};

/// Shared state for [`session_layer`].
#[derive(Clone)]
pub struct SessionState {
    pub store: Arc<dyn SessionStore>,
    pub config: Arc<SessionConfig>,
}

impl SessionState {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

/// Response extension naming the session a request ran under, by log id.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub log_id: String,
}

impl ResolvedSession {
    fn of(session: &Session) -> Self {
        Self {
            log_id: session.log_id().to_string(),
        }
    }
}

/// Install with `axum::middleware::from_fn_with_state(state, session_layer)`.
///
/// Failing to create a session for a request without a usable one answers
/// with a 500 and never runs the handler. Failing to persist after the
/// handler also answers with a 500.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn session_layer(
    State(state): State<SessionState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let session = match resolve(&state, request.headers()).await {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "failed to create session");
            return AppError::from(err).into_response();
        }
    };

    let handle = SessionHandle::new(session, state.store.clone(), state.config.clone());
    SessionSlots::attach(
        request.extensions_mut(),
        &state.config.context_key,
        handle.clone(),
    );

    let response = next.run(request).await;

    let cookie = match handle.prepare_persist() {
        Some(session) => match persist(&state, &session).await {
            Ok(cookie) => cookie,
            Err(err) => {
                counter!(METRIC_SESSION_PERSIST_ERROR).increment(1);
                error!(session_id = %session.log_id(), error = %err, "failed to persist session");
                let mut failed = AppError::from(err).into_response();
                failed.extensions_mut().insert(ResolvedSession::of(&session));
                return failed;
            }
        },
        None => removal_cookie(&state.config),
    };

    let resolved = ResolvedSession {
        log_id: log_id(&handle.id()).to_string(),
    };
    let mut response = (CookieJar::new().add(cookie), response).into_response();
    response.extensions_mut().insert(resolved);
    response
}

async fn resolve(state: &SessionState, headers: &HeaderMap) -> Result<Session, SessionError> {
    let jar = CookieJar::from_headers(headers);
    let presented = jar
        .get(&state.config.cookie_name)
        .map(Cookie::value)
        .filter(|value| !value.is_empty());

    if let Some(value) = presented {
        match state.store.load(value).await {
            Ok(session) => {
                if let Err(err) = state.store.touch(session.id()).await {
                    warn!(session_id = %session.log_id(), error = %err, "failed to touch session");
                }
                counter!(METRIC_SESSION_RESOLVED).increment(1);
                debug!(session_id = %session.log_id(), outcome = "resumed", "session resolved");
                return Ok(session);
            }
            Err(err) if err.is_absent() => {
                debug!(session_id = %log_id(value), outcome = %err, "session not usable");
            }
            Err(err) => {
                warn!(error = %err, "session load failed; starting a new session");
            }
        }
    }

    let session = Session::new(state.config.max_age);
    state.store.save(&session).await?;
    counter!(METRIC_SESSION_CREATED).increment(1);
    debug!(session_id = %session.log_id(), outcome = "created", "session resolved");
    Ok(session)
}

async fn persist(state: &SessionState, session: &Session) -> Result<Cookie<'static>, SessionError> {
    state.store.save(session).await?;
    let value = state.store.cookie_value(session)?;
    Ok(session_cookie(&state.config, value))
}

pub(crate) fn session_cookie(config: &SessionConfig, value: String) -> Cookie<'static> {
    let mut builder = Cookie::build((config.cookie_name.clone(), value))
        .path(config.cookie_path.clone())
        .max_age(time::Duration::seconds(config.max_age_seconds()))
        .secure(config.secure)
        .http_only(config.http_only)
        .same_site(config.same_site.into());
    if let Some(domain) = &config.cookie_domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

pub(crate) fn removal_cookie(config: &SessionConfig) -> Cookie<'static> {
    let mut cookie = session_cookie(config, String::new());
    cookie.make_removal();
    cookie
}
