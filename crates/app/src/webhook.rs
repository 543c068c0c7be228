use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use stockflow_core::{billing::Subscription, notification::SubscriptionEvent};
use stockflow_storage::{NewWebhookEvent, SubscriptionError};
use stockflow_stripe::{CheckoutSessionObject, Event, EventKind, InvoiceObject, SubscriptionObject};

use crate::audit::{AuditEvent, AuditKind};
use crate::billing::notify_subscription;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "Stripe-Signature";
const TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ProblemResponse> {
    let start = Instant::now();
    let result = receive(&state, &headers, &body).await;
    let label = match &result {
        Ok((kind, _)) => kind.as_str(),
        Err(_) => "rejected",
    };
    histogram!("webhook_ack_latency_seconds", "type" => label.to_string())
        .record(start.elapsed().as_secs_f64());
    result.map(|(_, ack)| Json(ack))
}

async fn receive(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(String, WebhookAck), ProblemResponse> {
    let settings = state.billing();
    let secret = match (settings.enabled, settings.webhook_secret.as_ref()) {
        (true, Some(secret)) => secret.clone(),
        _ => {
            return Err(ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "billing_unavailable",
                "billing webhooks are not configured",
            ))
        }
    };

    let header = headers
        .get(HEADER_SIGNATURE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ProblemResponse::bad_request("missing_signature", "Stripe-Signature header is required")
        })?;
    let signature = SignatureHeader::parse(header)
        .map_err(|detail| ProblemResponse::bad_request("invalid_signature_header", detail))?;

    let now = state.now();
    let skew = (now.timestamp() - signature.timestamp).abs();
    if skew > TOLERANCE_SECS {
        warn!(stage = "billing", skew_seconds = skew, "webhook timestamp outside tolerance");
        return Err(ProblemResponse::bad_request(
            "timestamp_out_of_range",
            "signature timestamp outside the allowed tolerance",
        ));
    }

    if !signature.verify(&secret, body) {
        counter!("stripe_webhook_invalid_signature_total").increment(1);
        warn!(stage = "billing", "webhook signature mismatch");
        return Err(ProblemResponse::bad_request(
            "invalid_signature",
            "signature verification failed",
        ));
    }

    let payload = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::bad_request("invalid_payload", "request body must be valid UTF-8")
    })?;
    let event: Event = serde_json::from_str(payload).map_err(|err| {
        ProblemResponse::bad_request("invalid_payload", format!("failed to parse event: {err}"))
    })?;

    let repo = state.storage().webhook_events();
    let inserted = repo
        .insert(&NewWebhookEvent {
            event_id: &event.id,
            event_type: &event.event_type,
            payload_json: payload,
            received_at: now,
        })
        .await
        .map_err(|err| ProblemResponse::internal_error("billing", err))?;

    if inserted.is_duplicate() {
        counter!("stripe_webhook_total", "type" => event.event_type.clone(), "outcome" => "duplicate")
            .increment(1);
        info!(stage = "billing", event_id = %event.id, "duplicate webhook event skipped");
        return Ok((
            event.event_type,
            WebhookAck {
                received: true,
                duplicate: true,
            },
        ));
    }

    let outcome = match process(state, &event, now).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(stage = "billing", event_id = %event.id, error = %err, "webhook processing failed");
            Outcome::Failed(err.to_string())
        }
    };
    counter!("stripe_webhook_total", "type" => event.event_type.clone(), "outcome" => outcome.label())
        .increment(1);
    if let Err(err) = repo.mark_processed(&event.id, &outcome.describe(), now).await {
        warn!(stage = "billing", event_id = %event.id, error = %err, "failed to record webhook outcome");
    }

    info!(
        stage = "billing",
        event_id = %event.id,
        event_type = %event.event_type,
        outcome = %outcome.describe(),
        "webhook event handled"
    );
    state.audit().publish(
        AuditEvent::new(AuditKind::Billing, "webhook", now)
            .entity("stripe_event", event.id.clone())
            .output(json!({ "type": event.event_type, "outcome": outcome.describe() })),
    );

    Ok((
        event.event_type,
        WebhookAck {
            received: true,
            duplicate: false,
        },
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Processed,
    Ignored(&'static str),
    Failed(String),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored(_) => "ignored",
            Self::Failed(_) => "failed",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Processed => "processed".to_string(),
            Self::Ignored(reason) => format!("ignored: {reason}"),
            Self::Failed(reason) => format!("failed: {reason}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error("malformed event object: {0}")]
    Object(#[from] serde_json::Error),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("failed to load plan: {0}")]
    Plan(#[from] stockflow_storage::PlanError),
}

async fn process(state: &AppState, event: &Event, now: DateTime<Utc>) -> Result<Outcome, ProcessError> {
    match event.kind() {
        EventKind::CheckoutSessionCompleted => checkout_completed(state, event.object()?, now).await,
        EventKind::InvoicePaymentSucceeded => payment_succeeded(state, event.object()?, now).await,
        EventKind::InvoicePaymentFailed => payment_failed(state, event.object()?, now).await,
        EventKind::CustomerSubscriptionDeleted => {
            subscription_deleted(state, event.object()?, now).await
        }
        EventKind::Other => Ok(Outcome::Ignored("unhandled event type")),
    }
}

async fn checkout_completed(
    state: &AppState,
    session: CheckoutSessionObject,
    now: DateTime<Utc>,
) -> Result<Outcome, ProcessError> {
    let Some(plan_id) = session.metadata_value("plan_id") else {
        return Ok(Outcome::Ignored("missing plan_id metadata"));
    };
    let Some(user_id) = session
        .metadata_value("user_id")
        .or(session.client_reference_id.as_deref())
    else {
        return Ok(Outcome::Ignored("missing user_id metadata"));
    };

    let subscriptions = state.storage().subscriptions();
    if let Some(stripe_id) = session.subscription.as_deref() {
        if subscriptions.find_by_stripe_id(stripe_id).await?.is_some() {
            return Ok(Outcome::Ignored("subscription already recorded"));
        }
    }
    let Some(plan) = state.storage().plans().find(plan_id).await? else {
        return Ok(Outcome::Ignored("unknown plan"));
    };

    let mut subscription = Subscription::start(Uuid::new_v4().to_string(), user_id, &plan, now);
    subscription.stripe_subscription_id = session.subscription.clone();
    subscription.stripe_customer_id = session.customer.clone();
    match subscriptions.insert(&subscription).await {
        Ok(()) => {}
        Err(SubscriptionError::MissingReference) => return Ok(Outcome::Ignored("unknown user")),
        Err(err) => return Err(err.into()),
    }

    let trial = subscription.trial_ends_at.is_some();
    notify_subscription(
        state.storage(),
        state.notifier(),
        &subscription,
        SubscriptionEvent::Started { trial },
        now,
    )
    .await;
    Ok(Outcome::Processed)
}

async fn subscription_for(
    state: &AppState,
    stripe_id: Option<&str>,
) -> Result<Option<Subscription>, ProcessError> {
    let Some(stripe_id) = stripe_id else {
        return Ok(None);
    };
    Ok(state
        .storage()
        .subscriptions()
        .find_by_stripe_id(stripe_id)
        .await?)
}

async fn payment_succeeded(
    state: &AppState,
    invoice: InvoiceObject,
    now: DateTime<Utc>,
) -> Result<Outcome, ProcessError> {
    let Some(mut subscription) = subscription_for(state, invoice.subscription.as_deref()).await?
    else {
        return Ok(Outcome::Ignored("unknown subscription"));
    };
    if subscription.renew_period(now).is_err() {
        return Ok(Outcome::Ignored("subscription already closed"));
    }
    state.storage().subscriptions().update(&subscription).await?;
    notify_subscription(
        state.storage(),
        state.notifier(),
        &subscription,
        SubscriptionEvent::Renewed,
        now,
    )
    .await;
    Ok(Outcome::Processed)
}

async fn payment_failed(
    state: &AppState,
    invoice: InvoiceObject,
    now: DateTime<Utc>,
) -> Result<Outcome, ProcessError> {
    let Some(mut subscription) = subscription_for(state, invoice.subscription.as_deref()).await?
    else {
        return Ok(Outcome::Ignored("unknown subscription"));
    };
    if subscription.record_failed_payment(now).is_err() {
        return Ok(Outcome::Ignored("subscription already closed"));
    }
    state.storage().subscriptions().update(&subscription).await?;
    let attempts = subscription.failed_payment_attempts;
    notify_subscription(
        state.storage(),
        state.notifier(),
        &subscription,
        SubscriptionEvent::PaymentFailed { attempts },
        now,
    )
    .await;
    Ok(Outcome::Processed)
}

async fn subscription_deleted(
    state: &AppState,
    object: SubscriptionObject,
    now: DateTime<Utc>,
) -> Result<Outcome, ProcessError> {
    let Some(mut subscription) = subscription_for(state, Some(object.id.as_str())).await? else {
        return Ok(Outcome::Ignored("unknown subscription"));
    };
    if subscription
        .cancel(false, Some("cancelled in Stripe".to_string()), now)
        .is_err()
    {
        return Ok(Outcome::Ignored("subscription already closed"));
    }
    state.storage().subscriptions().update(&subscription).await?;
    notify_subscription(
        state.storage(),
        state.notifier(),
        &subscription,
        SubscriptionEvent::Cancelled,
        now,
    )
    .await;
    Ok(Outcome::Processed)
}

/// Parsed `Stripe-Signature` header: `t=<unix>,v1=<hex>[,v1=<hex>…]`.
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    fn parse(value: &str) -> Result<Self, String> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in value.split(',') {
            let Some((key, raw)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    timestamp = Some(
                        raw.parse::<i64>()
                            .map_err(|_| "timestamp is not an integer".to_string())?,
                    )
                }
                "v1" => {
                    // Unknown or malformed entries are skipped; at least one must decode.
                    if let Ok(bytes) = hex::decode(raw) {
                        signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or_else(|| "missing timestamp".to_string())?;
        if signatures.is_empty() {
            return Err("missing v1 signature".to_string());
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }

    fn verify(&self, secret: &[u8], body: &[u8]) -> bool {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
            return false;
        };
        mac.update(self.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = mac.finalize().into_bytes();
        let expected: &[u8] = expected.as_ref();
        self.signatures
            .iter()
            .any(|candidate| bool::from(expected.ct_eq(candidate.as_slice())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use stockflow_core::billing::{BillingInterval, SubscriptionStatus};

    use crate::billing::tests::plan;
    use crate::test_support::{test_config, TestApp};

    const SECRET: &str = "whsec_test";

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    async fn webhook_app() -> TestApp {
        let mut config = test_config();
        config.stripe.enabled = true;
        config.stripe.secret_key = Some("sk_test_123".into());
        config.stripe.webhook_secret = Some(SECRET.into());
        TestApp::with_config(config).await.at(fixed_now())
    }

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac");
        mac.update(format!("{timestamp}.{body}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn deliver(app: &TestApp, signature: Option<String>, body: &str) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/billing/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(HEADER_SIGNATURE, signature);
        }
        let response = app
            .router()
            .oneshot(builder.body(Body::from(body.to_string())).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn signed(app: &TestApp, body: &Value) -> (StatusCode, Value) {
        let raw = body.to_string();
        let signature = sign(SECRET, fixed_now().timestamp(), &raw);
        deliver(app, Some(signature), &raw).await
    }

    fn checkout_event(id: &str, plan_id: &str, user_id: &str) -> Value {
        json!({
            "id": id,
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": "sub_stripe_1",
                "client_reference_id": user_id,
                "metadata": { "plan_id": plan_id, "user_id": user_id, "cadence": "monthly" }
            }}
        })
    }

    fn invoice_event(id: &str, kind: &str) -> Value {
        json!({
            "id": id,
            "type": kind,
            "data": { "object": { "id": "in_1", "subscription": "sub_stripe_1" } }
        })
    }

    async fn stored_subscription(app: &TestApp) -> Subscription {
        app.database
            .subscriptions()
            .find_by_stripe_id("sub_stripe_1")
            .await
            .expect("lookup")
            .expect("subscription")
    }

    #[test]
    fn signature_header_parsing() {
        let parsed = SignatureHeader::parse("t=1700000000,v1=00ff,v0=zz,v1=nothex").expect("parse");
        assert_eq!(parsed.timestamp, 1_700_000_000);
        assert_eq!(parsed.signatures, vec![vec![0x00, 0xff]]);

        assert!(SignatureHeader::parse("v1=00ff").is_err());
        assert!(SignatureHeader::parse("t=abc,v1=00ff").is_err());
        assert!(SignatureHeader::parse("t=1700000000").is_err());
    }

    #[test]
    fn any_matching_signature_verifies() {
        let header = sign(SECRET, 1_700_000_000, "{}");
        let rotated = format!("{header},v1={}", "ab".repeat(32));
        let parsed = SignatureHeader::parse(&rotated).expect("parse");
        assert!(parsed.verify(SECRET.as_bytes(), b"{}"));
        assert!(!parsed.verify(b"other", b"{}"));
        assert!(!parsed.verify(SECRET.as_bytes(), b"{ }"));
    }

    #[tokio::test]
    async fn disabled_billing_answers_unavailable() {
        let app = TestApp::new().await;
        let (status, body) = deliver(&app, Some("t=1,v1=00".into()), "{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["type"], "billing_unavailable");
    }

    #[tokio::test]
    async fn rejects_bad_signatures() {
        let app = webhook_app().await;
        let body = checkout_event("evt_1", "basic", "u-1").to_string();

        let (status, problem) = deliver(&app, None, &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "missing_signature");

        let (status, problem) = deliver(&app, Some("garbage".into()), &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "invalid_signature_header");

        let forged = sign("whsec_other", fixed_now().timestamp(), &body);
        let (status, problem) = deliver(&app, Some(forged), &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "invalid_signature");

        let stale = sign(SECRET, fixed_now().timestamp() - TOLERANCE_SECS - 1, &body);
        let (status, problem) = deliver(&app, Some(stale), &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "timestamp_out_of_range");
    }

    #[tokio::test]
    async fn checkout_completion_starts_subscription_once() {
        let app = webhook_app().await;
        app.user("u-1", "buyer@example.com", "user").await;
        app.database
            .plans()
            .insert(&plan("basic", BillingInterval::Monthly, 0), fixed_now())
            .await
            .expect("plan");

        let event = checkout_event("evt_1", "basic", "u-1");
        let (status, ack) = signed(&app, &event).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack, json!({ "received": true, "duplicate": false }));

        let subscription = stored_subscription(&app).await;
        assert_eq!(subscription.user_id, "u-1");
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.stripe_customer_id.as_deref(), Some("cus_1"));

        let (status, ack) = signed(&app, &event).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["duplicate"], true);

        let all = app
            .database
            .subscriptions()
            .list_for_user("u-1")
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(
            app.database
                .webhook_events()
                .outcome("evt_1")
                .await
                .expect("outcome")
                .as_deref(),
            Some("processed")
        );
    }

    #[tokio::test]
    async fn checkout_without_metadata_is_ignored() {
        let app = webhook_app().await;
        let event = json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_2", "metadata": {} } }
        });
        let (status, _) = signed(&app, &event).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            app.database
                .webhook_events()
                .outcome("evt_2")
                .await
                .expect("outcome")
                .as_deref(),
            Some("ignored: missing plan_id metadata")
        );

        let (status, _) = signed(&app, &json!({
            "id": "evt_3",
            "type": "customer.created",
            "data": { "object": { "id": "cus_9" } }
        }))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            app.database
                .webhook_events()
                .outcome("evt_3")
                .await
                .expect("outcome")
                .as_deref(),
            Some("ignored: unhandled event type")
        );
    }

    #[tokio::test]
    async fn invoice_events_drive_subscription_lifecycle() {
        let app = webhook_app().await;
        let (_, token) = app.user("u-1", "buyer@example.com", "user").await;
        app.database
            .plans()
            .insert(&plan("basic", BillingInterval::Monthly, 0), fixed_now())
            .await
            .expect("plan");
        signed(&app, &checkout_event("evt_1", "basic", "u-1")).await;
        let started = stored_subscription(&app).await;

        signed(&app, &invoice_event("evt_fail", "invoice.payment_failed")).await;
        let failed = stored_subscription(&app).await;
        assert_eq!(failed.failed_payment_attempts, 1);

        signed(&app, &invoice_event("evt_paid", "invoice.payment_succeeded")).await;
        let renewed = stored_subscription(&app).await;
        assert_eq!(renewed.failed_payment_attempts, 0);
        assert!(renewed.current_period_end > started.current_period_end);

        signed(&app, &json!({
            "id": "evt_del",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_stripe_1", "status": "canceled" } }
        }))
        .await;
        let cancelled = stored_subscription(&app).await;
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

        // Started, payment failed, renewed, cancelled.
        let (_, list) = app.get("/api/notifications?page_size=10", &token).await;
        assert_eq!(list["total_count"], 4);
        let kinds: Vec<&str> = list["items"]
            .as_array()
            .expect("items")
            .iter()
            .filter_map(|item| item["kind"].as_str())
            .collect();
        assert!(kinds.contains(&"payment"));
        assert!(kinds.contains(&"subscription"));
    }
}
