use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.session.backend, SessionBackend::Memory);
    assert_eq!(settings.session.cookie_name, "session_id");
    assert_eq!(settings.session.max_age, Duration::from_secs(86_400));
    assert!(settings.session.http_only);
    assert!(!settings.session.secure);
    assert_eq!(settings.session.same_site, SameSitePolicy::Lax);
    assert_eq!(settings.cache.backend, CacheBackend::Memory);
    assert_eq!(settings.cache.response_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.statuses, vec![StatusCode::OK]);
    assert_eq!(settings.cache.max_body_bytes, 1_048_576);
    assert!(!settings.needs_redis());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.session.max_age_seconds = Some(60);

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        session_max_age_seconds: Some(120),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.session.max_age, Duration::from_secs(120));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn redis_backend_requires_url() {
    let mut raw = RawSettings::default();
    raw.session.backend = Some("redis".to_string());

    let err = Settings::from_raw(raw.clone()).expect_err("missing url");
    assert!(matches!(err, LoadError::Invalid { key: "redis.url", .. }));

    raw.redis.url = Some("redis://127.0.0.1/".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.session.backend, SessionBackend::Redis);
    assert!(settings.needs_redis());
}

#[test]
fn blank_redis_url_counts_as_missing() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("redis".to_string());
    raw.redis.url = Some("   ".to_string());

    let err = Settings::from_raw(raw).expect_err("blank url");
    assert!(matches!(err, LoadError::Invalid { key: "redis.url", .. }));
}

#[test]
fn unknown_backends_are_rejected() {
    let mut raw = RawSettings::default();
    raw.session.backend = Some("disk".to_string());
    assert!(matches!(
        Settings::from_raw(raw).expect_err("bad session backend"),
        LoadError::Invalid {
            key: "session.backend",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.cache.backend = Some("cookie".to_string());
    assert!(matches!(
        Settings::from_raw(raw).expect_err("bad cache backend"),
        LoadError::Invalid {
            key: "cache.backend",
            ..
        }
    ));
}

#[test]
fn zero_durations_are_rejected() {
    let mut raw = RawSettings::default();
    raw.session.max_age_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.response_ttl_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.rate_limit.window_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn session_max_age_above_four_hundred_days_is_rejected() {
    let mut raw = RawSettings::default();
    raw.session.max_age_seconds = Some(400 * 24 * 60 * 60);
    assert!(Settings::from_raw(raw).is_ok());

    let mut raw = RawSettings::default();
    raw.session.max_age_seconds = Some(u64::MAX / 2);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "session.max_age_seconds",
            ..
        })
    ));
}

#[test]
fn cache_statuses_are_validated() {
    let mut raw = RawSettings::default();
    raw.cache.statuses = Some(vec![200, 404]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.cache.statuses,
        vec![StatusCode::OK, StatusCode::NOT_FOUND]
    );

    let mut raw = RawSettings::default();
    raw.cache.statuses = Some(vec![42]);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.statuses = Some(Vec::new());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn same_site_and_secret_are_parsed() {
    let mut raw = RawSettings::default();
    raw.session.same_site = Some("Strict".to_string());
    let secret = "k".repeat(64);
    raw.session.cookie_secret = Some(format!(" {secret} "));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.session.same_site, SameSitePolicy::Strict);
    assert_eq!(settings.session.cookie_secret.as_deref(), Some(secret.as_str()));

    let mut raw = RawSettings::default();
    raw.session.cookie_secret = Some("hunter2".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "session.cookie_secret",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.session.same_site = Some("sometimes".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["larder"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "larder",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--session-backend",
        "cookie",
        "--session-secure",
        "true",
        "--redis-url",
        "redis://cache:6379/",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.session_backend.as_deref(), Some("cookie"));
            assert_eq!(serve.overrides.session_secure, Some(true));
            assert_eq!(
                serve.overrides.redis_url.as_deref(),
                Some("redis://cache:6379/")
            );
        }
    }
}
