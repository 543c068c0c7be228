use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{
    BuildError as PrometheusBuildError, PrometheusBuilder, PrometheusHandle,
};
use std::{
    sync::{Mutex, OnceLock},
    time::Instant,
};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use stockflow_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] PrometheusBuildError),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: OnceLock<Mutex<()>> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_FILTER: &str = "info,sqlx=warn,tower_http=info";

const GAUGES: &[(&str, &str)] = &[
    ("app_build_info", "Build metadata for the running binary"),
    ("app_uptime_seconds", "Seconds since the process started"),
    ("sse_clients", "Connected notification stream clients"),
];

const COUNTERS: &[(&str, &str)] = &[
    ("http_auth_failures_total", "Requests rejected for a missing or invalid bearer token"),
    ("auth_logins_total", "Login attempts, labelled by result"),
    ("mail_send_failures_total", "Outgoing emails that could not be delivered, labelled by purpose"),
    ("stripe_webhook_total", "Stripe webhook events handled, labelled by type and outcome"),
    ("stripe_webhook_invalid_signature_total", "Stripe webhook requests with a bad signature"),
    ("inventory_stock_changes_total", "Stock adjustments, labelled by kind"),
    ("notifications_dispatched_total", "Notifications delivered, labelled by channel"),
    ("subscription_transitions_total", "Subscriptions settled by maintenance, labelled by new status"),
    ("sse_ring_miss_total", "Stream resumes older than the replay ring"),
    ("rate_limit_rejections_total", "Requests rejected by the rate limiter, labelled by rule"),
    ("db_ttl_deleted_total", "Rows removed or expired by retention sweeps, labelled by table"),
    ("db_busy_total", "SQLite busy conditions hit by maintenance, labelled by operation"),
];

const HISTOGRAMS: &[(&str, &str)] = &[
    ("webhook_ack_latency_seconds", "Seconds taken to acknowledge a Stripe webhook"),
    ("db_checkpoint_seconds", "WAL checkpoint duration in seconds"),
];

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Pretty logs for development and tests, JSON lines in production.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_timer(UtcTime::rfc_3339());

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.environment {
        Environment::Production => registry.with(base.json()).try_init()?,
        Environment::Development | Environment::Test => registry
            .with(base.event_format(tracing_fmt::format().pretty()))
            .try_init()?,
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let guard = METRICS_INSTALL_GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = METRICS_HANDLE.get() {
        drop(guard);
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle.clone()).ok();
    drop(guard);

    for (name, help) in GAUGES {
        describe_gauge!(*name, *help);
    }
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
    for (name, help) in HISTOGRAMS {
        describe_histogram!(*name, *help);
    }
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    body.push_str("# TYPE app_build_info gauge\n");
    body.push_str(&format!(
        "app_build_info{{version=\"{}\",git=\"{}\"}} 1\n",
        BUILD_VERSION,
        build_git_sha()
    ));

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    body.push_str("# TYPE app_uptime_seconds gauge\n");
    body.push_str(&format!("app_uptime_seconds {}\n", uptime));

    body
}
