use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use stockflow_core::{
    billing::{
        entitled_subscription, BillingInterval, Cadence, Entitlements, Subscription,
        SubscriptionPlan,
    },
    notification::{subscription_event, SubscriptionEvent},
    permissions,
};
use stockflow_storage::{Database, PlanError, SubscriptionError};
use stockflow_stripe::{CreateCheckoutSession, StripeClient};
use stockflow_util::StripeConfig;

use crate::audit::{AuditEvent, AuditKind};
use crate::auth::AuthenticatedUser;
use crate::notifier::Notifier;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const STRIPE_TIMEOUT: Duration = Duration::from_secs(15);

/// Billing switches and Stripe identifiers resolved from configuration.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub enabled: bool,
    pub webhook_secret: Option<Arc<[u8]>>,
    pub success_url: String,
    pub cancel_url: String,
    pub price_monthly: Option<String>,
    pub price_annual: Option<String>,
}

impl BillingSettings {
    pub fn from_config(config: &StripeConfig) -> Self {
        Self {
            enabled: config.enabled,
            webhook_secret: config
                .webhook_secret
                .as_deref()
                .filter(|secret| !secret.is_empty())
                .map(|secret| Arc::from(secret.as_bytes())),
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
            price_monthly: config.price_monthly.clone(),
            price_annual: config.price_annual.clone(),
        }
    }

    pub fn fallback_price(&self, cadence: Cadence) -> Option<&str> {
        match cadence {
            Cadence::Monthly => self.price_monthly.as_deref(),
            Cadence::Annual => self.price_annual.as_deref(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StripeSetupError {
    #[error("invalid STRIPE_API_BASE: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Stripe client when billing is enabled and a secret key is configured.
pub fn build_stripe_client(config: &StripeConfig) -> Result<Option<StripeClient>, StripeSetupError> {
    let Some(secret_key) = config.secret_key.as_deref().filter(|key| !key.is_empty()) else {
        return Ok(None);
    };
    if !config.enabled {
        return Ok(None);
    }
    let base = Url::parse(&config.api_base)?;
    let http = Client::builder().timeout(STRIPE_TIMEOUT).build()?;
    Ok(Some(StripeClient::new(secret_key, base, http)))
}

fn plan_problem(err: PlanError) -> ProblemResponse {
    match err {
        PlanError::Duplicate => {
            ProblemResponse::conflict("plan_exists", "a plan with this id or name already exists")
        }
        other => ProblemResponse::internal_error("billing", other),
    }
}

fn subscription_problem(err: SubscriptionError) -> ProblemResponse {
    match err {
        SubscriptionError::NotFound => ProblemResponse::not_found("subscription not found"),
        other => ProblemResponse::internal_error("billing", other),
    }
}

pub async fn list_plans(
    State(state): State<AppState>,
) -> Result<Json<Vec<SubscriptionPlan>>, ProblemResponse> {
    let plans = state
        .storage()
        .plans()
        .list_public_active()
        .await
        .map_err(plan_problem)?;
    Ok(Json(plans))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionPlan>, ProblemResponse> {
    state
        .storage()
        .plans()
        .find(&id)
        .await
        .map_err(plan_problem)?
        .map(Json)
        .ok_or_else(|| ProblemResponse::not_found("plan not found"))
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub billing_interval: BillingInterval,
    #[serde(default)]
    pub trial_period_days: i64,
    #[serde(default = "default_max_users")]
    pub max_users: i64,
    #[serde(default)]
    pub max_projects: i64,
    #[serde(default)]
    pub max_storage_gb: i64,
    #[serde(default)]
    pub has_advanced_reporting: bool,
    #[serde(default)]
    pub has_api_access: bool,
    #[serde(default)]
    pub has_priority_support: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub stripe_price_id: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_max_users() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

impl From<CreatePlanRequest> for SubscriptionPlan {
    fn from(body: CreatePlanRequest) -> Self {
        Self {
            id: body
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: body.name.trim().to_string(),
            description: body.description,
            price_cents: body.price_cents,
            currency: body.currency.trim().to_ascii_uppercase(),
            billing_interval: body.billing_interval,
            trial_period_days: body.trial_period_days,
            max_users: body.max_users,
            max_projects: body.max_projects,
            max_storage_gb: body.max_storage_gb,
            has_advanced_reporting: body.has_advanced_reporting,
            has_api_access: body.has_api_access,
            has_priority_support: body.has_priority_support,
            is_active: body.is_active,
            is_public: body.is_public,
            sort_order: body.sort_order,
            stripe_price_id: body.stripe_price_id.filter(|price| !price.trim().is_empty()),
        }
    }
}

pub async fn create_plan(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<SubscriptionPlan>), ProblemResponse> {
    caller.require(permissions::SYSTEM_MANAGE_SETTINGS)?;
    let plan = SubscriptionPlan::from(body);
    plan.validate()
        .map_err(|err| ProblemResponse::bad_request("invalid_plan", err.to_string()))?;

    let now = state.now();
    state
        .storage()
        .plans()
        .insert(&plan, now)
        .await
        .map_err(plan_problem)?;

    info!(stage = "billing", plan_id = %plan.id, interval = plan.billing_interval.as_str(), "plan created");
    state.audit().publish(
        AuditEvent::new(AuditKind::Billing, "plan_created", now)
            .actor(caller.id().to_string())
            .entity("subscription_plan", plan.id.clone()),
    );
    Ok((StatusCode::CREATED, Json(plan)))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: String,
    pub cadence: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
    pub session_id: String,
}

pub async fn checkout(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ProblemResponse> {
    let cadence: Cadence = body
        .cadence
        .parse()
        .map_err(|err: stockflow_core::billing::BillingError| {
            ProblemResponse::bad_request("invalid_cadence", err.to_string())
        })?;

    let settings = state.billing();
    let client = match (settings.enabled, state.stripe()) {
        (true, Some(client)) => client,
        _ => {
            return Err(ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "billing_unavailable",
                "billing is not configured",
            ))
        }
    };

    let plan = state
        .storage()
        .plans()
        .find(&body.plan_id)
        .await
        .map_err(plan_problem)?
        .filter(|plan| plan.is_active)
        .ok_or_else(|| ProblemResponse::not_found("plan not found"))?;

    let Some(price_id) = plan
        .stripe_price_id
        .as_deref()
        .or_else(|| settings.fallback_price(cadence))
    else {
        error!(stage = "billing", plan_id = %plan.id, cadence = cadence.as_str(), "no stripe price configured");
        return Err(ProblemResponse::new(
            StatusCode::BAD_GATEWAY,
            "price_not_configured",
            "no Stripe price is configured for this plan",
        ));
    };

    let user_id = caller.id().to_string();
    let metadata = [
        ("plan_id", plan.id.as_str()),
        ("user_id", user_id.as_str()),
        ("cadence", cadence.as_str()),
    ];
    let session = client
        .create_checkout_session(&CreateCheckoutSession {
            price_id,
            success_url: &settings.success_url,
            cancel_url: &settings.cancel_url,
            customer_email: Some(&caller.user.email),
            client_reference_id: &user_id,
            metadata: &metadata,
        })
        .await
        .map_err(|err| {
            error!(stage = "billing", plan_id = %plan.id, error = %err, "stripe checkout failed");
            ProblemResponse::new(
                StatusCode::BAD_GATEWAY,
                "stripe_error",
                "payment provider request failed",
            )
        })?;

    let url = session.url.ok_or_else(|| {
        error!(stage = "billing", session_id = %session.id, "checkout session has no url");
        ProblemResponse::new(
            StatusCode::BAD_GATEWAY,
            "stripe_error",
            "payment provider returned no checkout url",
        )
    })?;

    info!(stage = "billing", user_id = %user_id, plan_id = %plan.id, session_id = %session.id, "checkout session created");
    state.audit().publish(
        AuditEvent::new(AuditKind::Billing, "checkout", state.now())
            .user(user_id)
            .entity("subscription_plan", plan.id.clone())
            .output(json!({ "session_id": session.id, "cadence": cadence.as_str() })),
    );
    Ok(Json(CheckoutResponse {
        url,
        session_id: session.id,
    }))
}

#[derive(Debug, Serialize)]
pub struct BillingStatus {
    pub enabled: bool,
    pub checkout_available: bool,
    pub webhook_configured: bool,
    pub monthly_price_configured: bool,
    pub annual_price_configured: bool,
}

pub async fn status(State(state): State<AppState>, _caller: AuthenticatedUser) -> Json<BillingStatus> {
    let settings = state.billing();
    Json(BillingStatus {
        enabled: settings.enabled,
        checkout_available: settings.enabled && state.stripe().is_some(),
        webhook_configured: settings.webhook_secret.is_some(),
        monthly_price_configured: settings.price_monthly.is_some(),
        annual_price_configured: settings.price_annual.is_some(),
    })
}

pub async fn my_subscriptions(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<Vec<Subscription>>, ProblemResponse> {
    let subscriptions = state
        .storage()
        .subscriptions()
        .list_for_user(caller.id())
        .await
        .map_err(subscription_problem)?;
    Ok(Json(subscriptions))
}

pub async fn entitlements(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<Entitlements>, ProblemResponse> {
    let candidates = state
        .storage()
        .subscriptions()
        .access_candidates_for_user(caller.id())
        .await
        .map_err(subscription_problem)?;
    let Some(subscription) = entitled_subscription(&candidates, Utc::now()) else {
        return Ok(Json(Entitlements::free()));
    };

    let plan = state
        .storage()
        .plans()
        .find(&subscription.plan_id)
        .await
        .map_err(plan_problem)?;
    Ok(Json(match plan {
        Some(plan) => Entitlements::for_plan(&plan, subscription),
        None => {
            warn!(stage = "billing", subscription_id = %subscription.id, plan_id = %subscription.plan_id, "subscription references a missing plan");
            Entitlements::free()
        }
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default = "default_true")]
    pub at_period_end: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Subscription>, ProblemResponse> {
    let repo = state.storage().subscriptions();
    let mut subscription = repo
        .find(&id)
        .await
        .map_err(subscription_problem)?
        .filter(|subscription| subscription.user_id == caller.id())
        .ok_or_else(|| ProblemResponse::not_found("subscription not found"))?;

    let now = state.now();
    subscription
        .cancel(body.at_period_end, body.reason, now)
        .map_err(|err| ProblemResponse::conflict("subscription_closed", err.to_string()))?;
    repo.update(&subscription).await.map_err(subscription_problem)?;

    info!(
        stage = "billing",
        subscription_id = %subscription.id,
        status = %subscription.status,
        at_period_end = body.at_period_end,
        "subscription cancellation requested"
    );
    state.audit().publish(
        AuditEvent::new(AuditKind::Billing, "subscription_cancel", now)
            .user(caller.id().to_string())
            .entity("subscription", subscription.id.clone())
            .output(json!({ "status": subscription.status.as_str() })),
    );
    if subscription.status.is_terminal() {
        notify_subscription(
            state.storage(),
            state.notifier(),
            &subscription,
            SubscriptionEvent::Cancelled,
            now,
        )
        .await;
    }
    Ok(Json(subscription))
}

/// Tells the owner about a lifecycle change. Failures are logged only.
pub(crate) async fn notify_subscription(
    database: &Database,
    notifier: &Notifier,
    subscription: &Subscription,
    event: SubscriptionEvent,
    now: DateTime<Utc>,
) {
    let plan_name = match database.plans().find(&subscription.plan_id).await {
        Ok(Some(plan)) => plan.name,
        Ok(None) => subscription.plan_id.clone(),
        Err(err) => {
            warn!(stage = "billing", plan_id = %subscription.plan_id, error = %err, "failed to load plan for notice");
            subscription.plan_id.clone()
        }
    };
    let draft = subscription_event(event, &plan_name, &subscription.id);
    if let Err(err) = notifier
        .dispatch_to_user(&subscription.user_id, &draft, now)
        .await
    {
        warn!(stage = "billing", subscription_id = %subscription.id, error = %err, "failed to send subscription notice");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;
    use serde_json::json;

    use crate::test_support::{test_config, TestApp};

    pub(crate) fn plan(id: &str, interval: BillingInterval, trial_days: i64) -> SubscriptionPlan {
        SubscriptionPlan {
            id: id.to_string(),
            name: format!("Plan {id}"),
            description: None,
            price_cents: 2900,
            currency: "USD".into(),
            billing_interval: interval,
            trial_period_days: trial_days,
            max_users: 5,
            max_projects: 20,
            max_storage_gb: 10,
            has_advanced_reporting: true,
            has_api_access: false,
            has_priority_support: false,
            is_active: true,
            is_public: true,
            sort_order: 1,
            stripe_price_id: None,
        }
    }

    async fn billing_app(server: &MockServer) -> TestApp {
        let mut config = test_config();
        config.stripe.enabled = true;
        config.stripe.secret_key = Some("sk_test_123".into());
        config.stripe.webhook_secret = Some("whsec_test".into());
        config.stripe.api_base = server.url("/v1/");
        config.stripe.price_monthly = Some("price_monthly".into());
        TestApp::with_config(config).await
    }

    #[test]
    fn settings_ignore_empty_webhook_secret() {
        let mut config = test_config().stripe;
        config.webhook_secret = Some(String::new());
        config.price_annual = Some("price_year".into());
        let settings = BillingSettings::from_config(&config);
        assert!(settings.webhook_secret.is_none());
        assert_eq!(settings.fallback_price(Cadence::Annual), Some("price_year"));
        assert_eq!(settings.fallback_price(Cadence::Monthly), None);
    }

    #[test]
    fn client_requires_enabled_flag_and_key() {
        let mut config = test_config().stripe;
        config.secret_key = Some("sk_test".into());
        assert!(build_stripe_client(&config).expect("build").is_none());
        config.enabled = true;
        assert!(build_stripe_client(&config).expect("build").is_some());
        config.api_base = "not a url".into();
        assert!(build_stripe_client(&config).is_err());
    }

    #[tokio::test]
    async fn plans_are_public_and_creation_is_restricted() {
        let app = TestApp::new().await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;
        let (_, admin) = app.user("a-1", "admin@example.com", "admin").await;
        let body = json!({
            "id": "pro",
            "name": "Pro",
            "price_cents": 4900,
            "currency": "eur",
            "billing_interval": "monthly",
            "trial_period_days": 14
        });

        let (status, _) = app.post("/api/subscription-plans", Some(&manager), body.clone()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) = app.post("/api/subscription-plans", Some(&admin), body.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["currency"], "EUR");

        let (status, _) = app.post("/api/subscription-plans", Some(&admin), body).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app
            .post(
                "/api/subscription-plans",
                Some(&admin),
                json!({ "name": "Bad", "price_cents": -5, "billing_interval": "annual" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, plans) = app
            .request(axum::http::Method::GET, "/api/subscription-plans", None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plans.as_array().expect("plans").len(), 1);

        let (status, plan) = app
            .request(axum::http::Method::GET, "/api/subscription-plans/pro", None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plan["trial_period_days"], 14);
    }

    #[tokio::test]
    async fn checkout_is_unavailable_without_stripe() {
        let app = TestApp::new().await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;
        app.database
            .plans()
            .insert(&plan("basic", BillingInterval::Monthly, 0), Utc::now())
            .await
            .expect("plan");

        let (status, _) = app
            .post(
                "/api/billing/checkout",
                Some(&token),
                json!({ "plan_id": "basic", "cadence": "weekly" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .post(
                "/api/billing/checkout",
                Some(&token),
                json!({ "plan_id": "basic", "cadence": "monthly" }),
            )
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["type"], "billing_unavailable");

        let (status, flags) = app.get("/api/billing/status", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flags["enabled"], false);
        assert_eq!(flags["checkout_available"], false);
    }

    #[tokio::test]
    async fn checkout_creates_stripe_session() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/checkout/sessions")
                    .header("Authorization", "Bearer sk_test_123")
                    .body_contains("line_items%5B0%5D%5Bprice%5D=price_monthly")
                    .body_contains("client_reference_id=u-1")
                    .body_contains("metadata%5Bplan_id%5D=basic")
                    .body_contains("metadata%5Bcadence%5D=monthly");
                then.status(200).json_body(json!({
                    "id": "cs_test_1",
                    "url": "https://checkout.stripe.com/c/pay/cs_test_1"
                }));
            })
            .await;

        let app = billing_app(&server).await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;
        app.database
            .plans()
            .insert(&plan("basic", BillingInterval::Monthly, 0), Utc::now())
            .await
            .expect("plan");

        let (status, body) = app
            .post(
                "/api/billing/checkout",
                Some(&token),
                json!({ "plan_id": "basic", "cadence": "Monthly" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], "cs_test_1");
        assert_eq!(body["url"], "https://checkout.stripe.com/c/pay/cs_test_1");
        mock.assert_async().await;

        let (status, _) = app
            .post(
                "/api/billing/checkout",
                Some(&token),
                json!({ "plan_id": "missing", "cadence": "monthly" }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app
            .post(
                "/api/billing/checkout",
                Some(&token),
                json!({ "plan_id": "basic", "cadence": "annual" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["type"], "price_not_configured");
    }

    #[tokio::test]
    async fn stripe_errors_surface_as_bad_gateway() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/checkout/sessions");
                then.status(400).json_body(json!({
                    "error": { "message": "No such price: 'price_monthly'" }
                }));
            })
            .await;

        let app = billing_app(&server).await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;
        app.database
            .plans()
            .insert(&plan("basic", BillingInterval::Monthly, 0), Utc::now())
            .await
            .expect("plan");

        let (status, body) = app
            .post(
                "/api/billing/checkout",
                Some(&token),
                json!({ "plan_id": "basic", "cadence": "monthly" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["type"], "stripe_error");
    }

    #[tokio::test]
    async fn entitlements_follow_active_subscription() {
        let app = TestApp::new().await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;
        let (_, other) = app.user("u-2", "other@example.com", "user").await;

        let (_, free) = app.get("/api/billing/entitlements", &token).await;
        assert_eq!(free["plan_name"], "Free");

        let now = Utc::now();
        let pro = plan("pro", BillingInterval::Annual, 14);
        app.database.plans().insert(&pro, now).await.expect("plan");
        let subscription = Subscription::start("sub-1".into(), "u-1", &pro, now);
        app.database
            .subscriptions()
            .insert(&subscription)
            .await
            .expect("subscription");

        let (_, granted) = app.get("/api/billing/entitlements", &token).await;
        assert_eq!(granted["plan_id"], "pro");
        assert_eq!(granted["is_trial"], true);
        assert_eq!(granted["max_users"], 5);

        let (_, listed) = app.get("/api/billing/subscriptions", &token).await;
        assert_eq!(listed.as_array().expect("list").len(), 1);

        let (status, _) = app
            .post("/api/billing/subscriptions/sub-1/cancel", Some(&other), json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, pending) = app
            .post(
                "/api/billing/subscriptions/sub-1/cancel",
                Some(&token),
                json!({ "reason": "too pricey" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending["status"], "trial");
        assert!(pending["cancel_at"].is_string());

        let (status, cancelled) = app
            .post(
                "/api/billing/subscriptions/sub-1/cancel",
                Some(&token),
                json!({ "at_period_end": false }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");

        let (_, free) = app.get("/api/billing/entitlements", &token).await;
        assert_eq!(free["plan_name"], "Free");

        let (status, body) = app
            .post(
                "/api/billing/subscriptions/sub-1/cancel",
                Some(&token),
                json!({ "at_period_end": false }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "subscription_closed");
    }

    #[tokio::test]
    async fn past_due_entitlements_end_with_grace_period() {
        let app = TestApp::new().await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;
        let (_, second) = app.user("u-2", "second@example.com", "user").await;

        let now = Utc::now();
        let pro = plan("pro", BillingInterval::Monthly, 0);
        app.database.plans().insert(&pro, now).await.expect("plan");

        let lapsed_at = now - chrono::Duration::days(30);
        let mut lapsed = Subscription::start("sub-lapsed".into(), "u-1", &pro, lapsed_at);
        for _ in 0..3 {
            lapsed.record_failed_payment(lapsed_at).expect("failed payment");
        }
        app.database
            .subscriptions()
            .insert(&lapsed)
            .await
            .expect("subscription");

        let (_, body) = app.get("/api/billing/entitlements", &token).await;
        assert_eq!(body["plan_name"], "Free");

        let premium = plan("premium", BillingInterval::Monthly, 0);
        app.database.plans().insert(&premium, now).await.expect("plan");
        let older = Subscription::start(
            "sub-active".into(),
            "u-2",
            &pro,
            now - chrono::Duration::days(2),
        );
        let mut in_grace = Subscription::start("sub-grace".into(), "u-2", &premium, now);
        for _ in 0..3 {
            in_grace.record_failed_payment(now).expect("failed payment");
        }
        let repo = app.database.subscriptions();
        repo.insert(&older).await.expect("older");
        repo.insert(&in_grace).await.expect("in grace");

        let (_, body) = app.get("/api/billing/entitlements", &second).await;
        assert_eq!(body["plan_id"], "pro");
    }
}
