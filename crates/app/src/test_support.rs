//! Fixtures shared by the handler and service tests.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use stockflow_core::{identity::User, roles::RoleDefinition};
use stockflow_storage::{Database, NewUser};
use stockflow_util::{
    AppConfig, AuthConfig, Environment, InventoryConfig, SmtpConfig, SseConfig, StripeConfig,
};

use crate::audit::AuditHub;
use crate::mailer::LogMailer;
use crate::passwords::hash_for_tests;
use crate::router::{app_router, AppState};
use crate::telemetry;

pub const PASSWORD: &str = "Secret123";

/// File-backed database in a temporary directory, migrated and seeded with system roles.
pub async fn database() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let db = Database::connect(&url).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    db.roles()
        .ensure_system_roles(&RoleDefinition::system_defaults(), Utc::now())
        .await
        .expect("seed roles");
    (db, dir)
}

/// Verified, active account whose password is [`PASSWORD`].
pub async fn create_user(db: &Database, id: &str, email: &str, role: &str) -> User {
    let now = Utc::now();
    let hash = hash_for_tests(PASSWORD);
    db.users()
        .insert(&NewUser {
            id,
            first_name: "Test",
            last_name: id,
            email,
            phone_number: None,
            timezone: "UTC",
            role,
            password_hash: &hash,
            email_verified_at: Some(now),
            created_at: now,
        })
        .await
        .expect("insert user")
}

pub fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        environment: Environment::Test,
        database_url: "sqlite::memory:".into(),
        public_base_url: "http://localhost:5173".into(),
        auth: AuthConfig {
            jwt_secret: "test-jwt-secret".into(),
            jwt_ttl_secs: 3600,
            verification_ttl_hours: 24,
            require_verified_email: true,
            bootstrap_admin: None,
        },
        inventory: InventoryConfig {
            low_stock_threshold: 10,
        },
        sse: SseConfig {
            heartbeat_secs: 25,
            ring_max: 64,
            ring_ttl_secs: 300,
        },
        stripe: StripeConfig {
            enabled: false,
            secret_key: None,
            webhook_secret: None,
            api_base: "https://api.stripe.com/v1/".into(),
            success_url: "http://localhost:5173/checkout/success".into(),
            cancel_url: "http://localhost:5173/checkout/cancel".into(),
            price_monthly: None,
            price_annual: None,
        },
        smtp: SmtpConfig {
            enabled: false,
            host: "localhost".into(),
            port: 1025,
            username: None,
            password: None,
            use_tls: false,
            from_email: "noreply@stockflowpro.local".into(),
            from_name: "StockFlow Pro".into(),
        },
    }
}

/// An application wired to a temporary database and a capturing mailer.
pub struct TestApp {
    pub state: AppState,
    pub mailer: LogMailer,
    pub database: Database,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let (database, dir) = database().await;
        let mailer = LogMailer::new();
        let metrics = telemetry::init_metrics().expect("metrics");
        let stripe = crate::billing::build_stripe_client(&config.stripe).expect("stripe client");
        let state = AppState::new(
            &config,
            metrics,
            AuditHub::new(),
            database.clone(),
            Arc::new(mailer.clone()),
            stripe,
        );
        Self {
            state,
            mailer,
            database,
            _dir: dir,
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.state = self.state.with_clock(Arc::new(move || now));
        self
    }

    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    /// Creates an account and returns it with a valid access token.
    pub async fn user(&self, id: &str, email: &str, role: &str) -> (User, String) {
        let user = create_user(&self.database, id, email, role).await;
        let token = self
            .state
            .tokens()
            .issue(&user, self.state.now())
            .expect("issue token")
            .token;
        (user, token)
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, token, Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(token), Some(body)).await
    }
}
