use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use stockflow_core::{
    identity::{
        normalize_email, validate_name, validate_password, validate_timezone, Email, SystemRole,
        User, ValidationError,
    },
    permissions::PermissionSet,
};
use stockflow_storage::{Database, NewUser, UserError};
use stockflow_util::BootstrapAdmin;

use crate::audit::{AuditEvent, AuditKind, AuditPayload};
use crate::auth::AuthenticatedUser;
use crate::mailer::{password_reset_email, send_logged, verification_email};
use crate::passwords::{dummy_hash, hash_password, verify_password};
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::verification::TokenPurpose;

const INVALID_CREDENTIALS: &str = "invalid email or password";

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub user: User,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
    /// Resolved from the token when omitted.
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub email: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

pub(crate) fn validation_problem(err: ValidationError) -> ProblemResponse {
    ProblemResponse::bad_request("validation_error", err.to_string())
}

fn invalid_credentials() -> ProblemResponse {
    counter!("http_auth_failures_total").increment(1);
    ProblemResponse::new(StatusCode::UNAUTHORIZED, "invalid_credentials", INVALID_CREDENTIALS)
}

/// PBKDF2 is CPU bound, so it runs off the async workers.
async fn hash_blocking(password: String) -> Result<String, ProblemResponse> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))
}

async fn verify_blocking(password: String, encoded: String) -> Result<bool, ProblemResponse> {
    let outcome = tokio::task::spawn_blocking(move || verify_password(&password, &encoded))
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;
    match outcome {
        Ok(matches) => Ok(matches),
        Err(err) => {
            warn!(stage = "auth", error = %err, "stored password hash rejected");
            Ok(false)
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), ProblemResponse> {
    let email = Email::parse(&body.email).map_err(validation_problem)?;
    let first_name = validate_name("first_name", &body.first_name).map_err(validation_problem)?;
    let last_name = validate_name("last_name", &body.last_name).map_err(validation_problem)?;
    validate_password(&body.password).map_err(validation_problem)?;
    let timezone = body
        .timezone
        .as_deref()
        .map(str::trim)
        .filter(|tz| !tz.is_empty())
        .unwrap_or("UTC");
    validate_timezone(timezone).map_err(validation_problem)?;
    let phone_number = body
        .phone_number
        .as_deref()
        .map(str::trim)
        .filter(|phone| !phone.is_empty());

    let password_hash = hash_blocking(body.password).await?;
    let now = state.now();
    let id = Uuid::new_v4().to_string();
    let user = state
        .storage()
        .users()
        .insert(&NewUser {
            id: &id,
            first_name: &first_name,
            last_name: &last_name,
            email: email.as_str(),
            phone_number,
            timezone,
            role: SystemRole::User.as_str(),
            password_hash: &password_hash,
            email_verified_at: None,
            created_at: now,
        })
        .await
        .map_err(|err| match err {
            UserError::EmailTaken => {
                ProblemResponse::conflict("email_taken", "email is already registered")
            }
            other => ProblemResponse::internal_error("auth", other),
        })?;

    send_verification(&state, &user, now).await;

    info!(stage = "auth", user_id = %user.id, "account registered");
    state.audit().publish(
        AuditEvent::new(AuditKind::Auth, "register", now)
            .user(user.id.clone())
            .input(AuditPayload::redacted()),
    );
    Ok((StatusCode::CREATED, Json(user)))
}

async fn send_verification(state: &AppState, user: &User, now: DateTime<Utc>) {
    let token = match state
        .verification()
        .generate(&user.email, TokenPurpose::EmailVerification, now)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            warn!(stage = "auth", user_id = %user.id, error = %err, "failed to issue verification token");
            return;
        }
    };
    match verification_email(
        &state.settings().public_base_url,
        &user.email,
        &user.full_name(),
        &token,
    ) {
        Ok(email) => {
            send_logged(state.mailer(), email, "verification").await;
        }
        Err(err) => warn!(stage = "auth", error = %err, "failed to render verification email"),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ProblemResponse> {
    let email = normalize_email(&body.email);
    let now = state.now();
    let record = state
        .storage()
        .users()
        .find_by_email(&email)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;

    let Some(record) = record else {
        verify_blocking(body.password, dummy_hash().to_string()).await?;
        counter!("auth_logins_total", "result" => "unknown_account").increment(1);
        return Err(invalid_credentials());
    };
    if !verify_blocking(body.password, record.password_hash.clone()).await? {
        counter!("auth_logins_total", "result" => "bad_password").increment(1);
        state.audit().publish(
            AuditEvent::new(AuditKind::Auth, "login_failed", now).user(record.user.id.clone()),
        );
        return Err(invalid_credentials());
    }
    let user = record.user;
    if !user.is_active {
        counter!("auth_logins_total", "result" => "inactive").increment(1);
        return Err(invalid_credentials());
    }
    if state.settings().require_verified_email && !user.is_email_verified() {
        counter!("auth_logins_total", "result" => "unverified").increment(1);
        return Err(ProblemResponse::new(
            StatusCode::FORBIDDEN,
            "email_not_verified",
            "verify your email address before signing in",
        ));
    }

    let issued = state
        .tokens()
        .issue(&user, now)
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;
    let permissions = state
        .storage()
        .roles()
        .permissions_for(&user.role)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;

    counter!("auth_logins_total", "result" => "success").increment(1);
    info!(stage = "auth", user_id = %user.id, "login succeeded");
    state
        .audit()
        .publish(AuditEvent::new(AuditKind::Auth, "login", now).user(user.id.clone()));

    Ok(Json(LoginResponse {
        access_token: issued.token,
        token_type: "Bearer",
        expires_at: issued.expires_at,
        user,
        permissions: PermissionSet::new(permissions).to_sorted_vec(),
    }))
}

pub async fn verify_email(
    State(state): State<AppState>,
    Json(body): Json<TokenRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    let invalid_link = || {
        ProblemResponse::bad_request("invalid_token", "verification link is invalid or has expired")
    };
    let now = state.now();
    let email = match body.email {
        Some(email) => email,
        None => state
            .verification()
            .email_for_token(&body.token, now)
            .await
            .map_err(|err| ProblemResponse::internal_error("auth", err))?
            .ok_or_else(invalid_link)?,
    };
    let valid = state
        .verification()
        .validate(&body.token, &email, TokenPurpose::EmailVerification, now)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;
    if !valid {
        return Err(invalid_link());
    }
    let email = normalize_email(&email);
    state
        .storage()
        .users()
        .mark_email_verified(&email, now)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;

    state.audit().publish(
        AuditEvent::new(AuditKind::Auth, "email_verified", now).message(email),
    );
    Ok(Json(json!({ "verified": true })))
}

/// Always 202 so callers cannot tell which addresses have accounts.
pub async fn resend_verification(
    State(state): State<AppState>,
    Json(body): Json<EmailRequest>,
) -> Result<StatusCode, ProblemResponse> {
    let email = normalize_email(&body.email);
    let record = state
        .storage()
        .users()
        .find_by_email(&email)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;
    if let Some(record) = record {
        if record.user.is_active && !record.user.is_email_verified() {
            send_verification(&state, &record.user, state.now()).await;
        }
    }
    Ok(StatusCode::ACCEPTED)
}

/// Always 202, like `resend_verification`.
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(body): Json<EmailRequest>,
) -> Result<StatusCode, ProblemResponse> {
    let email = normalize_email(&body.email);
    let now = state.now();
    let record = state
        .storage()
        .users()
        .find_by_email(&email)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;
    let Some(record) = record.filter(|record| record.user.is_active) else {
        return Ok(StatusCode::ACCEPTED);
    };

    match state
        .verification()
        .generate(&email, TokenPurpose::PasswordReset, now)
        .await
    {
        Ok(token) => match password_reset_email(
            &state.settings().public_base_url,
            &record.user.email,
            &record.user.full_name(),
            &token,
        ) {
            Ok(message) => {
                send_logged(state.mailer(), message, "password_reset").await;
            }
            Err(err) => warn!(stage = "auth", error = %err, "failed to render reset email"),
        },
        Err(err) => {
            warn!(stage = "auth", user_id = %record.user.id, error = %err, "failed to issue reset token")
        }
    }
    state.audit().publish(
        AuditEvent::new(AuditKind::Auth, "password_reset_requested", now)
            .user(record.user.id.clone()),
    );
    Ok(StatusCode::ACCEPTED)
}

pub async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    validate_password(&body.new_password).map_err(validation_problem)?;
    let now = state.now();
    let invalid = || {
        ProblemResponse::bad_request("invalid_token", "reset link is invalid or has expired")
    };

    let valid = state
        .verification()
        .validate(&body.token, &body.email, TokenPurpose::PasswordReset, now)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;
    if !valid {
        return Err(invalid());
    }
    let record = state
        .storage()
        .users()
        .find_by_email(&normalize_email(&body.email))
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?
        .ok_or_else(invalid)?;

    let password_hash = hash_blocking(body.new_password).await?;
    state
        .storage()
        .users()
        .update_password_hash(&record.user.id, &password_hash, now)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;

    info!(stage = "auth", user_id = %record.user.id, "password reset");
    state.audit().publish(
        AuditEvent::new(AuditKind::Auth, "password_reset", now).user(record.user.id.clone()),
    );
    Ok(Json(json!({ "message": "password reset successful" })))
}

pub async fn change_password(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    let record = state
        .storage()
        .users()
        .find_by_id(caller.id())
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?
        .ok_or_else(|| ProblemResponse::not_found("user not found"))?;

    if !verify_blocking(body.current_password, record.password_hash).await? {
        return Err(ProblemResponse::bad_request(
            "invalid_password",
            "current password is incorrect",
        ));
    }
    validate_password(&body.new_password).map_err(validation_problem)?;

    let now = state.now();
    let password_hash = hash_blocking(body.new_password).await?;
    state
        .storage()
        .users()
        .update_password_hash(caller.id(), &password_hash, now)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?;

    state.audit().publish(
        AuditEvent::new(AuditKind::Auth, "password_changed", now).user(caller.id().to_string()),
    );
    Ok(Json(json!({ "message": "password changed successfully" })))
}

pub async fn me(caller: AuthenticatedUser) -> Json<MeResponse> {
    Json(MeResponse {
        permissions: caller.permissions.to_sorted_vec(),
        user: caller.user,
    })
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid bootstrap admin: {0}")]
    Invalid(#[from] ValidationError),
    #[error("failed to create bootstrap admin: {0}")]
    Storage(#[from] UserError),
}

/// Creates the configured admin account unless the address is already taken.
/// Returns whether an account was created.
pub async fn bootstrap_admin(
    database: &Database,
    admin: &BootstrapAdmin,
    now: DateTime<Utc>,
) -> Result<bool, BootstrapError> {
    let email = Email::parse(&admin.email)?;
    validate_password(&admin.password)?;
    if database.users().find_by_email(email.as_str()).await?.is_some() {
        return Ok(false);
    }

    let password_hash = hash_password(&admin.password);
    let id = Uuid::new_v4().to_string();
    database
        .users()
        .insert(&NewUser {
            id: &id,
            first_name: "System",
            last_name: "Administrator",
            email: email.as_str(),
            phone_number: None,
            timezone: "UTC",
            role: SystemRole::Admin.as_str(),
            password_hash: &password_hash,
            email_verified_at: Some(now),
            created_at: now,
        })
        .await?;
    info!(stage = "auth", user_id = %id, "bootstrap admin created");
    Ok(true)
}
