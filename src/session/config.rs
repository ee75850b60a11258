//! Session cookie and lifetime configuration.

use std::time::Duration;

use axum_extra::extract::cookie::SameSite;

pub const DEFAULT_COOKIE_NAME: &str = "session_id";
pub const DEFAULT_COOKIE_PATH: &str = "/";
pub const DEFAULT_CONTEXT_KEY: &str = "session";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Longest lifetime a session is granted. Browsers cap cookie `Max-Age` at
/// 400 days, so anything longer is clamped to this.
pub const MAX_SESSION_AGE: Duration = Duration::from_secs(400 * 24 * 60 * 60);

/// `SameSite` attribute written on the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSitePolicy {
    Strict,
    #[default]
    Lax,
    None,
}

impl From<SameSitePolicy> for SameSite {
    fn from(policy: SameSitePolicy) -> Self {
        match policy {
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::Lax => SameSite::Lax,
            SameSitePolicy::None => SameSite::None,
        }
    }
}

impl std::str::FromStr for SameSitePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lax" => Ok(Self::Lax),
            "none" => Ok(Self::None),
            other => Err(format!("unknown same-site policy `{other}`")),
        }
    }
}

/// How the session middleware names, scopes and ages its cookie.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub cookie_path: String,
    pub cookie_domain: Option<String>,
    /// Lifetime granted on every request; also the cookie `Max-Age`.
    pub max_age: Duration,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSitePolicy,
    /// Name under which the handle is attached to the request.
    pub context_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_path: DEFAULT_COOKIE_PATH.to_string(),
            cookie_domain: None,
            max_age: DEFAULT_MAX_AGE,
            secure: false,
            http_only: true,
            same_site: SameSitePolicy::Lax,
            context_key: DEFAULT_CONTEXT_KEY.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn with_cookie_path(mut self, path: impl Into<String>) -> Self {
        self.cookie_path = path.into();
        self
    }

    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.cookie_domain = Some(domain.into());
        self
    }

    /// Values above [`MAX_SESSION_AGE`] are clamped.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age.min(MAX_SESSION_AGE);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSitePolicy) -> Self {
        self.same_site = same_site;
        self
    }

    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = key.into();
        self
    }

    /// Cookie `Max-Age` in whole seconds, never above [`MAX_SESSION_AGE`].
    pub fn max_age_seconds(&self) -> i64 {
        i64::try_from(self.max_age.min(MAX_SESSION_AGE).as_secs()).unwrap_or(i64::MAX)
    }
}

impl From<&crate::config::SessionSettings> for SessionConfig {
    fn from(settings: &crate::config::SessionSettings) -> Self {
        Self {
            cookie_name: settings.cookie_name.clone(),
            cookie_path: settings.cookie_path.clone(),
            cookie_domain: settings.cookie_domain.clone(),
            max_age: settings.max_age,
            secure: settings.secure,
            http_only: settings.http_only,
            same_site: settings.same_site,
            context_key: DEFAULT_CONTEXT_KEY.to_string(),
        }
    }
}
