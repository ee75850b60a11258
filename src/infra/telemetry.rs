use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

pub const METRIC_CACHE_HIT: &str = "larder_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "larder_cache_miss_total";
pub const METRIC_CACHE_STORE: &str = "larder_cache_store_total";
pub const METRIC_CACHE_BACKEND_ERROR: &str = "larder_cache_backend_error_total";
pub const METRIC_SESSION_CREATED: &str = "larder_session_created_total";
pub const METRIC_SESSION_RESOLVED: &str = "larder_session_resolved_total";
pub const METRIC_SESSION_PERSIST_ERROR: &str = "larder_session_persist_error_total";
pub const METRIC_SESSION_SWEPT: &str = "larder_session_swept_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of response-cache hits."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of response-cache misses."
        );
        describe_counter!(
            METRIC_CACHE_STORE,
            Unit::Count,
            "Total number of responses written to the cache."
        );
        describe_counter!(
            METRIC_CACHE_BACKEND_ERROR,
            Unit::Count,
            "Cache backend failures that were downgraded to a miss or a skipped store."
        );
        describe_counter!(
            METRIC_SESSION_CREATED,
            Unit::Count,
            "Sessions created because no usable session was presented."
        );
        describe_counter!(
            METRIC_SESSION_RESOLVED,
            Unit::Count,
            "Requests that resumed an existing session."
        );
        describe_counter!(
            METRIC_SESSION_PERSIST_ERROR,
            Unit::Count,
            "Sessions that could not be saved after the handler completed."
        );
        describe_counter!(
            METRIC_SESSION_SWEPT,
            Unit::Count,
            "Expired sessions removed by the background sweep."
        );
    });
}
