use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use cookie::{Cookie, CookieJar, Key};

use super::SessionStore;
use crate::session::error::SessionError;
use crate::session::model::Session;

/// Name the payload is signed under. Signatures cover name and value, so
/// this must not change between releases.
const SIGNED_NAME: &str = "larder_session";

/// Stores the whole session inside the cookie.
///
/// Nothing is kept server side, so `save`, `delete`, `touch` and `sweep` do
/// nothing and a session cannot be revoked before it expires. The cookie
/// value is base64url-encoded JSON. With a [`Key`] configured it is signed
/// through the `cookie` crate's signed jar (HMAC-SHA256, verified in constant
/// time). Browsers cap cookies around 4 KiB.
#[derive(Default)]
pub struct CookieSessionStore {
    key: Option<Key>,
}

impl CookieSessionStore {
    /// Unsigned store. Clients can read and forge their own session data.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed(key: Key) -> Self {
        Self { key: Some(key) }
    }

    /// Signed store keyed by raw secret bytes, which must be at least 64 long.
    pub fn from_secret(secret: &[u8]) -> Result<Self, SessionError> {
        let key = Key::try_from(secret)
            .map_err(|err| SessionError::decode(format!("unusable signing secret: {err}")))?;
        Ok(Self::signed(key))
    }

    pub fn is_signed(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode(&self, session: &Session) -> Result<String, SessionError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(session)?);
        let Some(key) = &self.key else {
            return Ok(payload);
        };

        let mut jar = CookieJar::new();
        jar.signed_mut(key).add(Cookie::new(SIGNED_NAME, payload));
        jar.get(SIGNED_NAME)
            .map(|cookie| cookie.value().to_string())
            .ok_or_else(|| SessionError::decode("signed jar dropped the session cookie"))
    }

    pub fn decode(&self, value: &str) -> Result<Session, SessionError> {
        let payload = match &self.key {
            Some(key) => {
                let mut jar = CookieJar::new();
                jar.add_original(Cookie::new(SIGNED_NAME, value.to_string()));
                jar.signed(key)
                    .get(SIGNED_NAME)
                    .map(|cookie| cookie.value().to_string())
                    .ok_or_else(|| SessionError::decode("signature mismatch"))?
            }
            None => value.to_string(),
        };

        let raw = URL_SAFE_NO_PAD
            .decode(payload.as_bytes())
            .map_err(|err| SessionError::decode(format!("invalid base64: {err}")))?;
        serde_json::from_slice(&raw)
            .map_err(|err| SessionError::decode(format!("invalid session payload: {err}")))
    }
}

#[async_trait]
impl SessionStore for CookieSessionStore {
    async fn load(&self, cookie_value: &str) -> Result<Session, SessionError> {
        let session = self.decode(cookie_value)?;
        if session.is_expired() {
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    async fn save(&self, _session: &Session) -> Result<(), SessionError> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn touch(&self, _id: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn sweep(&self) -> Result<usize, SessionError> {
        Ok(0)
    }

    fn cookie_value(&self, session: &Session) -> Result<String, SessionError> {
        self.encode(session)
    }
}
