use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use larder::{
    cache::{Cache, FixedWindowLimiter, ResponseCacheConfig, ResponseCacheState},
    config::{self, CacheBackend, SessionBackend, Settings},
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        kv::{KvBackend, MemoryKv, RedisKv},
        telemetry,
    },
    session::{
        CookieSessionStore, KvSessionStore, MemorySessionStore, SessionConfig, SessionState,
        SessionStore, SweepTask,
    },
};
use tokio::signal;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let redis = connect_redis(&settings).await?;

    let (session_store, sweeper) = build_session_store(&settings, redis.clone())?;
    let sessions = SessionState::new(session_store, SessionConfig::from(&settings.session));

    let cache_backend: Arc<dyn KvBackend> = match settings.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryKv::new()),
        CacheBackend::Redis => require_redis(redis, "cache.backend")?,
    };
    let cache = Cache::with_prefixes(
        cache_backend,
        settings.cache.prefix.clone(),
        settings.cache.tag_prefix.clone(),
    );
    let response_cache =
        ResponseCacheState::new(cache.clone(), ResponseCacheConfig::from(&settings.cache));
    let limiter = FixedWindowLimiter::new(
        cache.clone(),
        Duration::from_secs(settings.rate_limit.window_seconds.get().into()),
        settings.rate_limit.max_requests.get(),
    );

    let state = HttpState::new(sessions, cache, response_cache, limiter);
    let result = serve_http(&settings, state).await;

    if let Some(sweeper) = sweeper {
        if tokio::time::timeout(settings.server.graceful_shutdown, sweeper.stop())
            .await
            .is_err()
        {
            warn!(
                target = "larder::serve",
                "session sweeper did not stop within the shutdown timeout"
            );
        }
    }

    result
}

async fn connect_redis(settings: &Settings) -> Result<Option<Arc<dyn KvBackend>>, AppError> {
    if !settings.needs_redis() {
        return Ok(None);
    }

    let url = settings
        .redis
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("redis.url is required by a redis backend"))?;
    let backend: Arc<dyn KvBackend> =
        Arc::new(RedisKv::connect(url).await.map_err(InfraError::from)?);
    info!(target = "larder::serve", "connected to redis");
    Ok(Some(backend))
}

fn require_redis(
    redis: Option<Arc<dyn KvBackend>>,
    key: &str,
) -> Result<Arc<dyn KvBackend>, AppError> {
    redis.ok_or_else(|| {
        AppError::from(InfraError::configuration(format!(
            "{key} is redis but no connection was opened"
        )))
    })
}

fn build_session_store(
    settings: &Settings,
    redis: Option<Arc<dyn KvBackend>>,
) -> Result<(Arc<dyn SessionStore>, Option<SweepTask>), AppError> {
    match settings.session.backend {
        SessionBackend::Memory => {
            let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
            let sweeper = SweepTask::spawn(store.clone(), settings.session.sweep_interval);
            Ok((store, Some(sweeper)))
        }
        SessionBackend::Cookie => {
            let cookie_store = match settings.session.cookie_secret.as_deref() {
                Some(secret) => CookieSessionStore::from_secret(secret.as_bytes())?,
                None => {
                    warn!(
                        target = "larder::serve",
                        "cookie sessions are unsigned; set session.cookie_secret"
                    );
                    CookieSessionStore::new()
                }
            };
            let store: Arc<dyn SessionStore> = Arc::new(cookie_store);
            Ok((store, None))
        }
        SessionBackend::Redis => {
            let backend = require_redis(redis, "session.backend")?;
            let store: Arc<dyn SessionStore> = Arc::new(KvSessionStore::with_prefix(
                backend,
                settings.session.prefix.clone(),
            ));
            Ok((store, None))
        }
    }
}

async fn serve_http(settings: &Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "larder::serve", addr = %settings.server.addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!(target = "larder::serve", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!(target = "larder::serve", "shutdown signal received"),
        Err(err) => {
            error!(target = "larder::serve", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
