use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{sse::Sse, IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use stockflow_core::permissions;
use stockflow_storage::Database;
use stockflow_stripe::StripeClient;
use stockflow_util::AppConfig;

use crate::audit::{audit_keep_alive, audit_stream, parse_kind_list, AuditFilter, AuditHub};
use crate::auth::{authenticate, TokenService};
use crate::billing::BillingSettings;
use crate::mailer::Mailer;
use crate::notifier::Notifier;
use crate::problem::ProblemResponse;
use crate::rate_limit::{self, RateLimiter};
use crate::sse::NotificationHub;
use crate::verification::VerificationService;
use crate::{
    account, billing, invoices, notifications, products, roles, telemetry, users, webhook,
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Runtime settings handlers read on every request.
#[derive(Debug)]
pub struct Settings {
    pub public_base_url: String,
    pub require_verified_email: bool,
    pub low_stock_threshold: i64,
    pub sse_heartbeat: Duration,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    audit: AuditHub,
    storage: Database,
    clock: Clock,
    tokens: TokenService,
    verification: VerificationService,
    mailer: Arc<dyn Mailer>,
    hub: NotificationHub,
    notifier: Notifier,
    stripe: Option<StripeClient>,
    billing: Arc<BillingSettings>,
    rate_limiter: RateLimiter,
    settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        metrics: PrometheusHandle,
        audit: AuditHub,
        storage: Database,
        mailer: Arc<dyn Mailer>,
        stripe: Option<StripeClient>,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let tokens = TokenService::new(
            config.auth.jwt_secret.as_bytes(),
            chrono::Duration::seconds(config.auth.jwt_ttl_secs as i64),
        );
        let verification = VerificationService::new(
            storage.clone(),
            chrono::Duration::hours(config.auth.verification_ttl_hours),
        );
        let hub = NotificationHub::new(
            storage.clone(),
            config.sse.ring_max,
            Duration::from_secs(config.sse.ring_ttl_secs),
        );
        let notifier = Notifier::new(
            storage.clone(),
            hub.clone(),
            mailer.clone(),
            audit.clone(),
            &config.public_base_url,
        );
        Self {
            metrics,
            audit,
            storage,
            clock,
            tokens,
            verification,
            mailer,
            hub,
            notifier,
            stripe,
            billing: Arc::new(BillingSettings::from_config(&config.stripe)),
            rate_limiter: RateLimiter::default(),
            settings: Arc::new(Settings {
                public_base_url: config.public_base_url.clone(),
                require_verified_email: config.auth.require_verified_email,
                low_stock_threshold: config.inventory.low_stock_threshold,
                sse_heartbeat: Duration::from_secs(config.sse.heartbeat_secs.max(1)),
            }),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn audit(&self) -> &AuditHub {
        &self.audit
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn verification(&self) -> &VerificationService {
        &self.verification
    }

    pub fn mailer(&self) -> &dyn Mailer {
        self.mailer.as_ref()
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn stripe(&self) -> Option<&StripeClient> {
        self.stripe.as_ref()
    }

    pub fn billing(&self) -> &BillingSettings {
        &self.billing
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings().public_base_url);
    let limiter = state.rate_limiter().clone();

    let api = Router::new()
        .route("/auth/register", post(account::register))
        .route("/auth/login", post(account::login))
        .route("/auth/verify-email", post(account::verify_email))
        .route("/auth/resend-verification", post(account::resend_verification))
        .route("/auth/forgot-password", post(account::forgot_password))
        .route("/auth/reset-password", post(account::reset_password))
        .route("/auth/change-password", post(account::change_password))
        .route("/auth/me", get(account::me))
        .route("/users", get(users::list))
        .route("/users/me", get(account::me).put(users::update_me))
        .route("/users/:id", get(users::get_one))
        .route("/users/:id/status", patch(users::set_status))
        .route("/users/:id/role", put(users::set_role))
        .route("/permissions", get(roles::permission_catalog))
        .route("/roles", get(roles::list).post(roles::create))
        .route("/roles/:name", delete(roles::remove))
        .route("/roles/:name/permissions", put(roles::replace_permissions))
        .route(
            "/role-upgrade-requests",
            get(roles::list_requests).post(roles::create_request),
        )
        .route("/role-upgrade-requests/mine", get(roles::my_requests))
        .route("/role-upgrade-requests/:id/review", post(roles::review_request))
        .route("/role-upgrade-requests/:id/cancel", post(roles::cancel_request))
        .route("/products", get(products::list).post(products::create))
        .route("/products/dashboard-stats", get(products::dashboard_stats))
        .route(
            "/products/:id",
            get(products::get_one)
                .put(products::update)
                .delete(products::remove),
        )
        .route("/products/:id/stock", patch(products::adjust_stock))
        .route("/invoices", get(invoices::list).post(invoices::create))
        .route("/invoices/mine", get(invoices::mine))
        .route(
            "/invoices/:id",
            get(invoices::get_one)
                .put(invoices::update)
                .delete(invoices::remove),
        )
        .route("/invoices/:id/items", post(invoices::add_item))
        .route(
            "/invoices/:id/items/:product_id",
            put(invoices::update_item).delete(invoices::remove_item),
        )
        .route("/subscription-plans", get(billing::list_plans).post(billing::create_plan))
        .route("/subscription-plans/:id", get(billing::get_plan))
        .route("/billing/checkout", post(billing::checkout))
        .route("/billing/status", get(billing::status))
        .route("/billing/subscriptions", get(billing::my_subscriptions))
        .route("/billing/subscriptions/:id/cancel", post(billing::cancel_subscription))
        .route("/billing/entitlements", get(billing::entitlements))
        .route("/billing/webhook", post(webhook::handle))
        .route("/notifications", get(notifications::list))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/mark-all-read", put(notifications::mark_all_read))
        .route(
            "/notifications/preferences",
            get(notifications::preferences).put(notifications::update_preference),
        )
        .route("/notifications/send", post(notifications::send))
        .route("/notifications/stream", get(notifications::stream))
        .route("/notifications/:id", delete(notifications::dismiss))
        .route("/notifications/:id/read", put(notifications::mark_read));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/audit", get(debug_audit))
        .nest("/api", api)
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, rate_limit::enforce))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(public_base_url: &str) -> CorsLayer {
    let origin = match HeaderValue::from_str(public_base_url.trim_end_matches('/')) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => AllowOrigin::list(Vec::<HeaderValue>::new()),
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("last-event-id"),
        ])
        .allow_credentials(true)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    kinds: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

async fn debug_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    ProblemResponse,
> {
    let token = query.token.as_deref().ok_or_else(|| {
        ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing token")
    })?;
    let caller = authenticate(&state, token).await?;
    caller.require(permissions::SYSTEM_VIEW_LOGS)?;

    let kinds = parse_kind_list(query.kinds.as_deref())
        .map_err(|err| ProblemResponse::bad_request("invalid_kinds", err))?;
    let stream = audit_stream(state.audit().clone(), AuditFilter::from_kinds(kinds));
    Ok(Sse::new(stream).keep_alive(audit_keep_alive()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tokio::time::{self, Duration};
    use tower::ServiceExt;

    use crate::audit::{AuditEvent, AuditKind};
    use crate::test_support::TestApp;

    #[tokio::test]
    async fn healthz_returns_ok_with_security_headers() {
        let app = TestApp::new().await;

        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(response.headers()["referrer-policy"], "no-referrer");
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = TestApp::new().await;

        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/products")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("preflight");
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[tokio::test]
    async fn audit_stream_requires_view_logs() {
        let app = TestApp::new().await;
        let (_, user_token) = app.user("u-1", "u@example.com", "user").await;
        let (status, _) = app
            .request(
                Method::GET,
                &format!("/_debug/audit?token={user_token}"),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .request(Method::GET, "/_debug/audit", None, None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn audit_stream_emits_events() {
        let app = TestApp::new().await;
        let (_, admin_token) = app.user("a-1", "admin@example.com", "admin").await;
        let audit = app.state.audit().clone();

        let request = Request::builder()
            .uri(format!("/_debug/audit?kinds=billing&token={admin_token}"))
            .body(Body::empty())
            .unwrap();

        let mut response = app.router().oneshot(request).await.expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);

        audit.publish(AuditEvent::new(AuditKind::Inventory, "ignored", Utc::now()));
        audit.publish(AuditEvent::new(AuditKind::Billing, "checkout", Utc::now()));

        let frame = time::timeout(Duration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");

        let data = match frame.into_data() {
            Ok(data) => data,
            Err(_) => panic!("expected data frame"),
        };
        let text = String::from_utf8(data.to_vec()).expect("utf-8");
        assert!(text.contains("event: billing"));
        assert!(text.contains("\"action\":\"checkout\""));
    }
}
