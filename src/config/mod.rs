//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use axum::http::StatusCode;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

use crate::session::{MAX_SESSION_AGE, SameSitePolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "larder";
const ENV_PREFIX: &str = "LARDER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_SESSION_COOKIE_NAME: &str = "session_id";
const DEFAULT_SESSION_COOKIE_PATH: &str = "/";
const DEFAULT_SESSION_MAX_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SESSION_SWEEP_INTERVAL_SECS: u64 = 60;
/// Signing keys for cookie sessions need 64 bytes of material.
const MIN_COOKIE_SECRET_LEN: usize = 64;
const DEFAULT_SESSION_PREFIX: &str = "session:";
const DEFAULT_CACHE_PREFIX: &str = "cache:";
const DEFAULT_CACHE_TAG_PREFIX: &str = "tag:";
const DEFAULT_CACHE_RESPONSE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_CACHE_MAX_BODY_BYTES: u64 = 1024 * 1024;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 120;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub redis: RedisSettings,
    pub session: SessionSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Cookie,
    Redis,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub backend: SessionBackend,
    pub cookie_name: String,
    pub cookie_path: String,
    pub cookie_domain: Option<String>,
    pub max_age: Duration,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSitePolicy,
    /// Signing secret for the cookie backend; unsigned when absent.
    pub cookie_secret: Option<String>,
    pub sweep_interval: Duration,
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub prefix: String,
    pub tag_prefix: String,
    pub response_ttl: Duration,
    pub statuses: Vec<StatusCode>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window_seconds: NonZeroU32,
    pub max_requests: NonZeroU32,
}

impl Settings {
    /// Whether any subsystem needs a Redis connection.
    pub fn needs_redis(&self) -> bool {
        self.session.backend == SessionBackend::Redis || self.cache.backend == CacheBackend::Redis
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    redis: RawRedisSettings,
    session: RawSessionSettings,
    cache: RawCacheSettings,
    rate_limit: RawRateLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(backend) = overrides.session_backend.as_ref() {
            self.session.backend = Some(backend.clone());
        }
        if let Some(secret) = overrides.session_cookie_secret.as_ref() {
            self.session.cookie_secret = Some(secret.clone());
        }
        if let Some(seconds) = overrides.session_max_age_seconds {
            self.session.max_age_seconds = Some(seconds);
        }
        if let Some(secure) = overrides.session_secure {
            self.session.secure = Some(secure);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(seconds) = overrides.cache_response_ttl_seconds {
            self.cache.response_ttl_seconds = Some(seconds);
        }
        if let Some(window) = overrides.rate_limit_window_seconds {
            self.rate_limit.window_seconds = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = Some(max);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            redis,
            session,
            cache,
            rate_limit,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let redis = build_redis_settings(redis);
        let session = build_session_settings(session)?;
        let cache = build_cache_settings(cache)?;
        let rate_limit = build_rate_limit_settings(rate_limit)?;

        let settings = Self {
            server,
            logging,
            redis,
            session,
            cache,
            rate_limit,
        };

        if settings.needs_redis() && settings.redis.url.is_none() {
            return Err(LoadError::invalid(
                "redis.url",
                "a redis backend is selected but no url is configured",
            ));
        }

        Ok(settings)
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_redis_settings(redis: RawRedisSettings) -> RedisSettings {
    RedisSettings {
        url: non_blank(redis.url),
    }
}

fn build_session_settings(session: RawSessionSettings) -> Result<SessionSettings, LoadError> {
    let backend = match session.backend.as_deref().map(str::trim) {
        None | Some("memory") => SessionBackend::Memory,
        Some("cookie") => SessionBackend::Cookie,
        Some("redis") => SessionBackend::Redis,
        Some(other) => {
            return Err(LoadError::invalid(
                "session.backend",
                format!("unknown backend `{other}` (expected memory, cookie or redis)"),
            ));
        }
    };

    let cookie_name = session
        .cookie_name
        .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_NAME.to_string());
    if cookie_name.trim().is_empty() {
        return Err(LoadError::invalid(
            "session.cookie_name",
            "must not be empty",
        ));
    }

    let max_age_secs = session
        .max_age_seconds
        .unwrap_or(DEFAULT_SESSION_MAX_AGE_SECS);
    if max_age_secs == 0 {
        return Err(LoadError::invalid(
            "session.max_age_seconds",
            "must be greater than zero",
        ));
    }
    if max_age_secs > MAX_SESSION_AGE.as_secs() {
        return Err(LoadError::invalid(
            "session.max_age_seconds",
            format!("must not exceed {} (400 days)", MAX_SESSION_AGE.as_secs()),
        ));
    }

    let sweep_secs = session
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SESSION_SWEEP_INTERVAL_SECS);
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "session.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    let cookie_secret = non_blank(session.cookie_secret);
    if cookie_secret
        .as_ref()
        .is_some_and(|secret| secret.len() < MIN_COOKIE_SECRET_LEN)
    {
        return Err(LoadError::invalid(
            "session.cookie_secret",
            format!("must be at least {MIN_COOKIE_SECRET_LEN} bytes"),
        ));
    }

    let same_site = match session.same_site.as_deref() {
        Some(value) => SameSitePolicy::from_str(value)
            .map_err(|reason| LoadError::invalid("session.same_site", reason))?,
        None => SameSitePolicy::Lax,
    };

    Ok(SessionSettings {
        backend,
        cookie_name,
        cookie_path: session
            .cookie_path
            .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_PATH.to_string()),
        cookie_domain: non_blank(session.cookie_domain),
        max_age: Duration::from_secs(max_age_secs),
        secure: session.secure.unwrap_or(false),
        http_only: session.http_only.unwrap_or(true),
        same_site,
        cookie_secret,
        sweep_interval: Duration::from_secs(sweep_secs),
        prefix: session
            .prefix
            .unwrap_or_else(|| DEFAULT_SESSION_PREFIX.to_string()),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend.as_deref().map(str::trim) {
        None | Some("memory") => CacheBackend::Memory,
        Some("redis") => CacheBackend::Redis,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}` (expected memory or redis)"),
            ));
        }
    };

    let ttl_secs = cache
        .response_ttl_seconds
        .unwrap_or(DEFAULT_CACHE_RESPONSE_TTL_SECS);
    if ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.response_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let statuses = match cache.statuses {
        Some(codes) if codes.is_empty() => {
            return Err(LoadError::invalid(
                "cache.statuses",
                "at least one status must be cacheable",
            ));
        }
        Some(codes) => codes
            .into_iter()
            .map(|code| {
                StatusCode::from_u16(code).map_err(|_| {
                    LoadError::invalid("cache.statuses", format!("`{code}` is not a status code"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![StatusCode::OK],
    };

    let max_body_bytes = cache
        .max_body_bytes
        .unwrap_or(DEFAULT_CACHE_MAX_BODY_BYTES);
    let max_body_bytes = usize::try_from(max_body_bytes)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid(
                "cache.max_body_bytes",
                "must be greater than zero and fit in usize",
            )
        })?;

    Ok(CacheSettings {
        backend,
        prefix: cache
            .prefix
            .unwrap_or_else(|| DEFAULT_CACHE_PREFIX.to_string()),
        tag_prefix: cache
            .tag_prefix
            .unwrap_or_else(|| DEFAULT_CACHE_TAG_PREFIX.to_string()),
        response_ttl: Duration::from_secs(ttl_secs),
        statuses,
        max_body_bytes: max_body_bytes.get(),
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let window_seconds_val = rate_limit
        .window_seconds
        .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
    let window_seconds = non_zero_u32(window_seconds_val, "rate_limit.window_seconds")?;

    let max_requests_val = rate_limit
        .max_requests
        .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS);
    let max_requests = non_zero_u32(max_requests_val, "rate_limit.max_requests")?;

    Ok(RateLimitSettings {
        window_seconds,
        max_requests,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    backend: Option<String>,
    cookie_name: Option<String>,
    cookie_path: Option<String>,
    cookie_domain: Option<String>,
    max_age_seconds: Option<u64>,
    secure: Option<bool>,
    http_only: Option<bool>,
    same_site: Option<String>,
    cookie_secret: Option<String>,
    sweep_interval_seconds: Option<u64>,
    prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    prefix: Option<String>,
    tag_prefix: Option<String>,
    response_ttl_seconds: Option<u64>,
    statuses: Option<Vec<u16>>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
